//! Completion events.
//!
//! Every settled query attempt and effect run emits two events: `Success` or
//! `Error`, then `Settled`. Listeners register for one kind and a [`Scope`]
//! and are called synchronously, right after the settled snapshot has been
//! written to the store.
//!
//! Superseded query attempts emit nothing.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use tracing::trace;

use crate::engine::{Effect, Query, Request, RequestStatus};
use crate::ids::{EffectId, ListenerId, QueryId, StoreId};

/// Event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Success,
    Error,
    Settled,
}

/// The snapshot that emitted an event.
#[derive(Debug, Clone)]
pub enum EventSource {
    Query(Rc<Query>),
    Effect(Rc<Effect>),
}

impl EventSource {
    pub fn key(&self) -> Option<&str> {
        match self {
            EventSource::Query(q) => q.key(),
            EventSource::Effect(e) => e.key(),
        }
    }
}

/// A completion event.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub source: EventSource,
    pub store: StoreId,
    pub request: Request,
}

/// Which events a listener receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    All,
    Store(StoreId),
    Query(QueryId),
    Effect(EffectId),
}

impl Scope {
    fn matches(&self, event: &Event) -> bool {
        match (self, &event.source) {
            (Scope::All, _) => true,
            (Scope::Store(id), _) => *id == event.store,
            (Scope::Query(id), EventSource::Query(q)) => *id == q.id(),
            (Scope::Effect(id), EventSource::Effect(e)) => *id == e.id(),
            _ => false,
        }
    }
}

type Callback = Rc<dyn Fn(&Event)>;

struct Registration {
    id: ListenerId,
    kind: EventKind,
    scope: Scope,
    callback: Callback,
}

/// Registry of event listeners.
#[derive(Default)]
pub struct EventBus {
    listeners: RefCell<Vec<Registration>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for events of `kind` within `scope`.
    pub fn on<F>(&self, kind: EventKind, scope: Scope, callback: F) -> ListenerId
    where
        F: Fn(&Event) + 'static,
    {
        let id = ListenerId::new();
        self.listeners.borrow_mut().push(Registration {
            id,
            kind,
            scope,
            callback: Rc::new(callback),
        });
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    pub(crate) fn dispatch(&self, event: &Event) {
        // Snapshot so callbacks may register or remove listeners.
        let callbacks: Vec<Callback> = self
            .listeners
            .borrow()
            .iter()
            .filter(|r| r.kind == event.kind && r.scope.matches(event))
            .map(|r| Rc::clone(&r.callback))
            .collect();
        trace!(kind = ?event.kind, listeners = callbacks.len(), "dispatching event");
        for callback in callbacks {
            callback(event);
        }
    }

    /// Emit the outcome event of `request`, then `Settled`.
    pub(crate) fn emit_completion(&self, source: EventSource, store: StoreId, request: Request) {
        let kind = match request.status() {
            RequestStatus::Error => EventKind::Error,
            _ => EventKind::Success,
        };
        let mut event = Event {
            kind,
            source,
            store,
            request,
        };
        self.dispatch(&event);
        event.kind = EventKind::Settled;
        self.dispatch(&event);
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RequestKind;
    use crate::error::FetchError;
    use std::cell::RefCell;

    fn event_for(query: &Rc<Query>, store: StoreId, failed: bool) -> (EventSource, StoreId, Request) {
        let request = Request::start(RequestKind::Query, None);
        let outcome = if failed {
            Err(FetchError::msg("down"))
        } else {
            Ok(serde_json::Value::Null)
        };
        (EventSource::Query(Rc::clone(query)), store, request.complete(&outcome))
    }

    fn query() -> Rc<Query> {
        Rc::new(Query::builder(|| async { Ok(1) }).build().unwrap())
    }

    #[test]
    fn success_then_settled() {
        let bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        for kind in [EventKind::Success, EventKind::Error, EventKind::Settled] {
            let seen = seen.clone();
            bus.on(kind, Scope::All, move |e| seen.borrow_mut().push(e.kind));
        }

        let (source, store, request) = event_for(&query(), StoreId::new(), false);
        bus.emit_completion(source, store, request);
        assert_eq!(*seen.borrow(), vec![EventKind::Success, EventKind::Settled]);
    }

    #[test]
    fn errors_emit_error_kind() {
        let bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        bus.on(EventKind::Error, Scope::All, move |e| {
            sink.borrow_mut().push(e.request.status())
        });

        let (source, store, request) = event_for(&query(), StoreId::new(), true);
        bus.emit_completion(source, store, request);
        assert_eq!(*seen.borrow(), vec![RequestStatus::Error]);
    }

    #[test]
    fn scopes_filter_events() {
        let bus = EventBus::new();
        let hits = Rc::new(RefCell::new(0));
        let q = query();
        let store = StoreId::new();

        for scope in [
            Scope::Store(store),
            Scope::Store(StoreId::new()),
            Scope::Query(q.id()),
            Scope::Query(query().id()),
            Scope::Effect(EffectId::new()),
        ] {
            let hits = hits.clone();
            bus.on(EventKind::Settled, scope, move |_| *hits.borrow_mut() += 1);
        }

        let (source, store, request) = event_for(&q, store, false);
        bus.emit_completion(source, store, request);
        assert_eq!(*hits.borrow(), 2);
    }

    #[test]
    fn off_removes_listener() {
        let bus = EventBus::new();
        let id = bus.on(EventKind::Settled, Scope::All, |_| {});
        assert_eq!(bus.listener_count(), 1);
        assert!(bus.off(id));
        assert!(!bus.off(id));
        assert_eq!(bus.listener_count(), 0);
    }
}
