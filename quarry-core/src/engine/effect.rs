//! Effect Implementation
//!
//! An Effect is an asynchronous mutation bound to one store slot.
//!
//! # How Effects Work
//!
//! 1. `trigger(args)` starts a run immediately. Runs are independent: any
//!    number may be in flight at once, and nothing is debounced or
//!    superseded.
//!
//! 2. The slot is rewritten when a run starts (it joins the running set and
//!    its request is recorded) and again when it settles.
//!
//! 3. Every settled run, success or failure, bumps `value_counter`. Queries
//!    that list the effect as a dependency compare by that counter, so each
//!    completion invalidates them exactly once.
//!
//! # Errors
//!
//! A failed run records its error as the effect's last error and appends it
//! to the error history. A later successful run clears the last error; the
//! history is kept.
//!
//! Request and error histories grow without bound unless the runtime's
//! `effect.history` setting caps them, in which case the oldest entries are
//! dropped first.

use std::cell::OnceCell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use futures_util::future::{self, FutureExt, LocalBoxFuture, Shared};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::request::{Request, RequestKind};
use super::Settled;
use crate::error::{Error, FetchError, Result};
use crate::events::EventSource;
use crate::ids::{EffectId, RequestId};
use crate::store::{live_effect, patch, Binding, Data, Store};

/// The shared future of one effect run.
pub type EffectPromise = Shared<LocalBoxFuture<'static, Result<(), FetchError>>>;

type RunFn = dyn Fn(Data) -> LocalBoxFuture<'static, Result<(), FetchError>>;

/// Descriptor shared by every snapshot of one effect.
pub(crate) struct EffectDef {
    id: EffectId,
    binding: OnceCell<Binding>,
    run: Box<RunFn>,
}

impl EffectDef {
    /// Attach the binding. Returns false if the effect was already bound.
    pub(crate) fn bind(&self, binding: Binding) -> bool {
        self.binding.set(binding).is_ok()
    }

    pub(crate) fn key(&self) -> Option<&str> {
        self.binding.get().map(Binding::key)
    }

    fn live(&self) -> Result<(&Binding, Rc<dyn Store>, Rc<Effect>)> {
        let binding = self
            .binding
            .get()
            .ok_or_else(|| Error::Unbound(self.id.to_string()))?;
        let store = binding.store()?;
        let current = live_effect(&store.get_state(), binding.key())?;
        Ok((binding, store, current))
    }

    fn history(&self) -> Option<usize> {
        self.binding
            .get()
            .and_then(Binding::runtime)
            .and_then(|runtime| runtime.config().effect.history)
    }

    fn trigger(self: &Rc<Self>, args: Data) -> Result<EffectPromise> {
        let (binding, store, current) = self.live()?;
        let key = binding.key();

        let request = Request::start(RequestKind::Effect, Some(args.clone()));
        let promise: EffectPromise = (self.run)(args).shared();
        let handle = {
            let def = Rc::clone(self);
            let promise = promise.clone();
            let request = request.clone();
            tokio::task::spawn_local(async move {
                let result = promise.await;
                def.settle(&request, result);
            })
        };

        let mut next = (*current).clone();
        next.running.push(Running {
            request: request.id(),
            promise: promise.clone(),
            settled: handle.map(|_| ()).boxed_local().shared(),
        });
        next.requests.push(request.clone());
        keep_last(&mut next.requests, self.history());
        next.last_started_request = Some(request);
        debug!(key, running = next.running.len(), "effect triggered");
        store.set_state(patch(key, next));
        Ok(promise)
    }

    fn settle(&self, request: &Request, result: Result<(), FetchError>) {
        let (binding, store, current) = match self.live() {
            Ok(live) => live,
            Err(error) => {
                warn!(effect = %self.id, %error, "dropping effect result");
                return;
            }
        };
        let key = binding.key();

        let completed = request.complete(&result.clone().map(|()| Data::Null));
        let mut next = (*current).clone();
        next.running.retain(|run| run.request != request.id());
        next.value_counter += 1;
        match result {
            Ok(()) => next.last_error = None,
            Err(error) => {
                next.last_error = Some(error.clone());
                next.errors.push(error);
                keep_last(&mut next.errors, self.history());
            }
        }
        if let Some(slot) = next.requests.iter_mut().find(|r| r.id() == completed.id()) {
            *slot = completed.clone();
        }
        next.last_completed_request = Some(completed.clone());

        let next = Rc::new(next);
        debug!(
            key,
            counter = next.value_counter,
            failed = next.last_error.is_some(),
            "effect settled"
        );
        store.set_state(patch(key, Rc::clone(&next)));

        if let Some(runtime) = binding.runtime() {
            runtime.emit_completion(EventSource::Effect(next), store.id(), completed);
        }
    }
}

fn keep_last<T>(items: &mut Vec<T>, cap: Option<usize>) {
    if let Some(cap) = cap {
        let excess = items.len().saturating_sub(cap);
        items.drain(..excess);
    }
}

/// One in-flight run.
#[derive(Clone)]
struct Running {
    request: RequestId,
    promise: EffectPromise,
    settled: Settled,
}

/// Snapshot of an effect slot.
#[derive(Clone)]
pub struct Effect {
    def: Rc<EffectDef>,
    value_counter: u64,
    running: Vec<Running>,
    last_error: Option<FetchError>,
    errors: Vec<FetchError>,
    requests: Vec<Request>,
    last_started_request: Option<Request>,
    last_completed_request: Option<Request>,
}

impl Effect {
    /// Create an effect around `run`.
    ///
    /// Arguments travel as JSON and are decoded into `A` when the run starts;
    /// a decoding failure fails the run.
    pub fn new<A, F, Fut>(run: F) -> Self
    where
        A: DeserializeOwned + 'static,
        F: Fn(A) -> Fut + 'static,
        Fut: Future<Output = Result<(), FetchError>> + 'static,
    {
        let run: Box<RunFn> = Box::new(move |args: Data| match serde_json::from_value::<A>(args) {
            Ok(args) => run(args).boxed_local(),
            Err(error) => future::ready(Err(FetchError::new(error))).boxed_local(),
        });
        Self {
            def: Rc::new(EffectDef {
                id: EffectId::new(),
                binding: OnceCell::new(),
                run,
            }),
            value_counter: 0,
            running: Vec::new(),
            last_error: None,
            errors: Vec::new(),
            requests: Vec::new(),
            last_started_request: None,
            last_completed_request: None,
        }
    }

    pub fn id(&self) -> EffectId {
        self.def.id
    }

    /// The slot key, once bound.
    pub fn key(&self) -> Option<&str> {
        self.def.key()
    }

    /// Start a run with `args`.
    pub fn trigger(&self, args: impl Serialize) -> Result<EffectPromise> {
        let args = serde_json::to_value(args)?;
        self.def.trigger(args)
    }

    /// Whether any run is in flight.
    pub fn is_loading(&self) -> bool {
        !self.running.is_empty()
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    /// Number of settled runs, successful or not.
    pub fn value_counter(&self) -> u64 {
        self.value_counter
    }

    /// Error of the most recently settled run, if it failed.
    pub fn error(&self) -> Option<&FetchError> {
        self.last_error.as_ref()
    }

    /// Every error ever produced, oldest first.
    pub fn errors(&self) -> &[FetchError] {
        &self.errors
    }

    /// Every run ever started, oldest first.
    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn last_started_request(&self) -> Option<&Request> {
        self.last_started_request.as_ref()
    }

    pub fn last_completed_request(&self) -> Option<&Request> {
        self.last_completed_request.as_ref()
    }

    /// Futures of the in-flight runs.
    pub fn promises(&self) -> Vec<EffectPromise> {
        self.running.iter().map(|run| run.promise.clone()).collect()
    }

    pub(crate) fn settled(&self) -> impl Iterator<Item = Settled> + '_ {
        self.running.iter().map(|run| run.settled.clone())
    }

    pub(crate) fn def(&self) -> &Rc<EffectDef> {
        &self.def
    }

    #[cfg(test)]
    pub(crate) fn with_completed_run(&self) -> Effect {
        Effect {
            value_counter: self.value_counter + 1,
            ..self.clone()
        }
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.def.id)
            .field("key", &self.key())
            .field("running", &self.running.len())
            .field("value_counter", &self.value_counter)
            .field("error", &self.last_error)
            .finish()
    }
}
