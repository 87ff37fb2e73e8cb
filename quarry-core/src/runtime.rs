//! Runtime
//!
//! The runtime connects stores to the query engine. It is the only place
//! that listens to store transitions.
//!
//! # How It Works
//!
//! 1. `subscribe(store)` binds every query and effect descriptor found in the
//!    store to its slot key, then registers a transition listener.
//!
//! 2. On every transition, the listener diffs each query's dependencies
//!    between the old and new state and invalidates the queries whose inputs
//!    changed (refetch or mark stale).
//!
//! 3. Settled attempts report back through the runtime's [`EventBus`].
//!
//! # Threading
//!
//! The runtime is single-threaded. Fetches, settlements and stale timers run
//! as local tasks, so everything that can start one must run inside a
//! [`tokio::task::LocalSet`].
//!
//! # Teardown
//!
//! Dropping the last runtime handle, or calling [`Runtime::shutdown`],
//! removes the transition listeners from every subscribed store. Bound
//! descriptors keep working with builtin defaults but no longer emit events.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::engine::{subscriber, Request};
use crate::events::{EventBus, EventSource};
use crate::hooks::Hooks;
use crate::ids::{ListenerId, QueryId, StoreId};
use crate::store::{bind, State, Store};

struct Subscription {
    store: Weak<dyn Store>,
    listener: ListenerId,
}

pub(crate) struct RuntimeInner {
    config: RuntimeConfig,
    subscriptions: RefCell<HashMap<StoreId, Subscription>>,
    /// Mount counts per query.
    mounts: RefCell<HashMap<QueryId, usize>>,
    events: EventBus,
}

impl RuntimeInner {
    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn is_mounted(&self, id: QueryId) -> bool {
        self.mounts.borrow().get(&id).is_some_and(|n| *n > 0)
    }

    pub(crate) fn mount(&self, id: QueryId) {
        *self.mounts.borrow_mut().entry(id).or_insert(0) += 1;
    }

    pub(crate) fn unmount(&self, id: QueryId) {
        let mut mounts = self.mounts.borrow_mut();
        if let Some(count) = mounts.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                mounts.remove(&id);
            }
        }
    }

    pub(crate) fn emit_completion(&self, source: EventSource, store: StoreId, request: Request) {
        self.events.emit_completion(source, store, request);
    }

    fn on_transition(&self, next: &State, prev: &State) {
        let work = subscriber::invalidations(next, prev, |id| self.is_mounted(id));
        subscriber::apply(work);
    }

    fn unsubscribe_all(&self) {
        for (id, subscription) in self.subscriptions.borrow_mut().drain() {
            if let Some(store) = subscription.store.upgrade() {
                store.unsubscribe(subscription.listener);
                debug!(store = %id, "store unsubscribed");
            }
        }
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}

/// Handle to a runtime. Clones share the same runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime with default configuration.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            inner: Rc::new(RuntimeInner {
                config,
                subscriptions: RefCell::new(HashMap::new()),
                mounts: RefCell::new(HashMap::new()),
                events: EventBus::new(),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Completion events of every query and effect bound by this runtime.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Bind `store`'s queries and effects and start watching it.
    ///
    /// Returns false if the store was already subscribed.
    pub fn subscribe<S: Store + 'static>(&self, store: &Rc<S>) -> bool {
        let store: Rc<dyn Store> = store.clone();
        let id = store.id();
        if self.inner.subscriptions.borrow().contains_key(&id) {
            return false;
        }

        let runtime = Rc::downgrade(&self.inner);
        let bound = bind(&store, &runtime);
        let listener = store.subscribe(Rc::new(move |next: &State, prev: &State| {
            if let Some(runtime) = runtime.upgrade() {
                runtime.on_transition(next, prev);
            }
        }));

        self.inner.subscriptions.borrow_mut().insert(
            id,
            Subscription {
                store: Rc::downgrade(&store),
                listener,
            },
        );
        info!(store = %id, bound, "store subscribed");
        true
    }

    /// Consumption hooks for `store`. Subscribes the store if needed.
    pub fn hooks<S: Store + 'static>(&self, store: &Rc<S>) -> Hooks {
        self.subscribe(store);
        let store: Rc<dyn Store> = store.clone();
        Hooks::new(self.clone(), store)
    }

    pub fn is_subscribed(&self, store: StoreId) -> bool {
        self.inner.subscriptions.borrow().contains_key(&store)
    }

    /// Number of live mounts of a query.
    pub fn mount_count(&self, query: QueryId) -> usize {
        self.inner.mounts.borrow().get(&query).copied().unwrap_or(0)
    }

    /// Stop watching every subscribed store.
    pub fn shutdown(&self) {
        self.inner.unsubscribe_all();
    }

    pub(crate) fn inner(&self) -> &Rc<RuntimeInner> {
        &self.inner
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("stores", &self.inner.subscriptions.borrow().len())
            .field("mounted", &self.inner.mounts.borrow().len())
            .field("events", &self.inner.events)
            .finish()
    }
}
