//! Query Implementation
//!
//! A Query is a cached asynchronous read bound to one store slot.
//!
//! # Lifecycle
//!
//! 1. A query is built detached from any store. Its slot key is unknown until
//!    the store is subscribed and the query is bound.
//!
//! 2. `trigger()` starts a fetch (or reuses the in-flight one inside the
//!    debounce window) and synchronously marks the slot as loading.
//!
//! 3. When the fetch settles, the result is committed only if the attempt is
//!    still the slot's in-flight attempt. A newer trigger supersedes older
//!    attempts; their results are dropped.
//!
//! 4. Dependency changes and the stale timer mark the query stale. A stale
//!    query keeps showing its last value until it is fetched again.
//!
//! # Snapshots
//!
//! The slot never changes in place. Every transition builds a new [`Query`]
//! snapshot and writes it to the store. Snapshots share one descriptor
//! (`QueryDef`) that holds the fetch function, the dependency function, the
//! options, the binding and the generation counter.
//!
//! # Generations
//!
//! Each started attempt takes the next generation number from the
//! descriptor. An attempt is authoritative while the slot's in-flight
//! generation equals its own; that comparison is the only synchronization
//! between competing attempts.

use std::cell::{Cell, OnceCell};
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use futures_util::future::{self, FutureExt, LocalBoxFuture, Shared};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::deps::{Dep, Deps};
use super::request::{Request, RequestKind};
use super::retry::{self, RetryDelay, RetryPolicy};
use super::Settled;
use crate::clock::now_ms;
use crate::config::QueryDefaults;
use crate::error::{Error, FetchError, Result};
use crate::events::EventSource;
use crate::ids::QueryId;
use crate::store::{live_query, patch, Binding, Data, State, Store};

/// The shared future of one query attempt, retries included.
pub type QueryPromise = Shared<LocalBoxFuture<'static, Result<Data, FetchError>>>;

type FetchFn = dyn Fn() -> LocalBoxFuture<'static, Result<Data, FetchError>>;
type DepsFn = dyn Fn(&State) -> Deps;

/// Result of the last accepted write. Value and error exclude each other.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Value(Data),
    Error(FetchError),
}

/// Where a query is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    /// Nothing cached and nothing needed.
    Idle,

    /// The cached value is missing or outdated and should be fetched.
    Stale,

    /// A fetch is in flight.
    Loading,

    /// The last fetch produced a value.
    Success,

    /// The last fetch failed.
    Failed,
}

/// Per-query overrides. `None` falls back to the runtime defaults.
#[derive(Clone, Default)]
struct QueryOptions {
    debounce: Option<Duration>,
    lazy: Option<bool>,
    stale_time: Option<Duration>,
    retry: Option<RetryPolicy>,
    retry_delay: Option<RetryDelay>,
}

/// Effective options after applying runtime defaults.
pub(crate) struct Settings {
    pub(crate) debounce: Duration,
    pub(crate) lazy: bool,
    pub(crate) stale_time: Option<Duration>,
    pub(crate) retry: RetryPolicy,
    pub(crate) retry_delay: Option<RetryDelay>,
}

/// The in-flight attempt of a query.
#[derive(Clone)]
pub(crate) struct InFlight {
    pub(crate) generation: u64,
    pub(crate) promise: QueryPromise,
    /// Completes once the settlement has been applied (or discarded).
    pub(crate) settled: Settled,
    pub(crate) started: Instant,
}

/// Options for a value commit.
#[derive(Default)]
pub(crate) struct Commit {
    /// Only applies to queries that have never been initialized.
    initial: bool,
    /// Rejected unless newer than the current value timestamp.
    timestamp: Option<u64>,
    /// Completed request to record.
    request: Option<Request>,
}

impl Commit {
    pub(crate) fn initial() -> Self {
        Self {
            initial: true,
            ..Self::default()
        }
    }

    pub(crate) fn at(timestamp: u64) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..Self::default()
        }
    }
}

/// Descriptor shared by every snapshot of one query.
pub(crate) struct QueryDef {
    id: QueryId,
    binding: OnceCell<Binding>,
    fetch: Box<FetchFn>,
    deps: Box<DepsFn>,
    options: QueryOptions,
    generation: Cell<u64>,
}

impl QueryDef {
    pub(crate) fn id(&self) -> QueryId {
        self.id
    }

    /// Attach the binding. Returns false if the query was already bound.
    pub(crate) fn bind(&self, binding: Binding) -> bool {
        self.binding.set(binding).is_ok()
    }

    pub(crate) fn key(&self) -> Option<&str> {
        self.binding.get().map(Binding::key)
    }

    fn binding(&self) -> Result<&Binding> {
        self.binding
            .get()
            .ok_or_else(|| Error::Unbound(self.id.to_string()))
    }

    pub(crate) fn dependencies(&self, state: &State) -> Deps {
        (self.deps)(state)
    }

    pub(crate) fn settings(&self) -> Settings {
        let defaults = self
            .binding
            .get()
            .and_then(Binding::runtime)
            .map(|runtime| runtime.config().query.clone())
            .unwrap_or_default();
        self.resolve(&defaults)
    }

    fn resolve(&self, defaults: &QueryDefaults) -> Settings {
        let options = &self.options;
        Settings {
            debounce: options.debounce.unwrap_or_else(|| defaults.debounce()),
            lazy: options.lazy.unwrap_or(defaults.lazy),
            stale_time: options.stale_time.or_else(|| defaults.stale_time()),
            retry: options
                .retry
                .clone()
                .unwrap_or(RetryPolicy::Attempts(defaults.retry)),
            retry_delay: options.retry_delay.clone(),
        }
    }

    /// The owning store and the live snapshot of this query.
    fn live(&self) -> Result<(Rc<dyn Store>, Rc<Query>)> {
        let binding = self.binding()?;
        let store = binding.store()?;
        let current = live_query(&store.get_state(), binding.key())?;
        Ok((store, current))
    }

    /// Whether `generation` is still the slot's in-flight attempt.
    fn is_current(&self, generation: u64) -> bool {
        self.live()
            .map(|(_, current)| current.is_generation(generation))
            .unwrap_or(false)
    }

    fn next_generation(&self) -> u64 {
        let next = self.generation.get() + 1;
        self.generation.set(next);
        next
    }

    pub(crate) fn trigger(self: &Rc<Self>) -> Result<QueryPromise> {
        self.start().map(|in_flight| in_flight.promise)
    }

    /// Start an attempt, or return the in-flight one inside the debounce
    /// window.
    pub(crate) fn start(self: &Rc<Self>) -> Result<InFlight> {
        let binding = self.binding()?;
        let key = binding.key();
        let store = binding.store()?;
        let state = store.get_state();
        let current = live_query(&state, key)?;
        let settings = self.settings();
        let now = Instant::now();

        if let Some(in_flight) = &current.in_flight {
            if now.saturating_duration_since(in_flight.started) < settings.debounce {
                trace!(key, generation = in_flight.generation, "reusing in-flight fetch");
                return Ok(in_flight.clone());
            }
        }

        // Dependencies without a value gate the fetch.
        let mut gates = Vec::new();
        for dep in self.dependencies(&state) {
            let Dep::Query(dep) = dep else { continue };
            if dep.value().is_some() || Rc::ptr_eq(dep.def(), self) {
                continue;
            }
            let gate = match &dep.in_flight {
                Some(in_flight) => in_flight.promise.clone(),
                None => dep.def().trigger()?,
            };
            gates.push(gate);
        }

        let generation = self.next_generation();
        let initial = {
            let def = Rc::clone(self);
            async move {
                future::try_join_all(gates).await?;
                (def.fetch)().await
            }
        };
        let fetch = {
            let def = Rc::clone(self);
            move || (def.fetch)()
        };
        let superseded = {
            let def = Rc::clone(self);
            move || !def.is_current(generation)
        };
        let promise: QueryPromise = retry::with_retries(
            initial,
            fetch,
            superseded,
            settings.retry,
            settings.retry_delay,
        )
        .boxed_local()
        .shared();

        let request = Request::start(RequestKind::Query, None);
        let handle = {
            let def = Rc::clone(self);
            let promise = promise.clone();
            let request = request.clone();
            tokio::task::spawn_local(async move {
                let result = promise.await;
                def.settle(generation, &request, result);
            })
        };
        let in_flight = InFlight {
            generation,
            promise,
            settled: handle.map(|_| ()).boxed_local().shared(),
            started: now,
        };

        // Gating may have written other slots; build on the live snapshot.
        let current = live_query(&store.get_state(), key)?;
        let next = Query {
            in_flight: Some(in_flight.clone()),
            needs_load: false,
            initialized: true,
            last_started_request: Some(request),
            ..(*current).clone()
        };
        debug!(key, generation, "query fetch started");
        store.set_state(patch(key, next));
        Ok(in_flight)
    }

    /// Apply the result of attempt `generation` if it is still authoritative.
    fn settle(self: &Rc<Self>, generation: u64, request: &Request, result: Result<Data, FetchError>) {
        let (store, current) = match self.live() {
            Ok(live) => live,
            Err(error) => {
                warn!(query = %self.id, %error, "dropping query result");
                return;
            }
        };
        let key = self.key().unwrap_or_default();
        if !current.is_generation(generation) {
            debug!(key, generation, "discarding superseded result");
            return;
        }

        let completed = request.complete(&result);
        let outcome = match result {
            Ok(value) => Outcome::Value(value),
            Err(error) => Outcome::Error(error),
        };
        let commit = Commit {
            request: Some(completed.clone()),
            ..Commit::default()
        };
        let Some(next) = current.commit(outcome, commit) else {
            return;
        };
        let next = Rc::new(self.arm(&current, next));
        debug!(key, generation, failed = next.error().is_some(), "query settled");
        store.set_state(patch(key, Rc::clone(&next)));

        if let Some(runtime) = self.binding.get().and_then(Binding::runtime) {
            runtime.emit_completion(EventSource::Query(next), store.id(), completed);
        }
    }

    /// Commit against the live slot and write the result.
    pub(crate) fn commit_live(self: &Rc<Self>, outcome: Outcome, commit: Commit) -> Result<Rc<Query>> {
        let (store, current) = self.live()?;
        match current.commit(outcome, commit) {
            Some(next) => {
                let next = Rc::new(self.arm(&current, next));
                store.set_state(patch(self.binding()?.key(), Rc::clone(&next)));
                Ok(next)
            }
            None => Ok(current),
        }
    }

    pub(crate) fn mark_stale(&self) -> Result<()> {
        let (store, current) = self.live()?;
        if let Some(timer) = &current.stale_timer {
            timer.abort();
        }
        let next = Query {
            needs_load: true,
            stale_timer: None,
            ..(*current).clone()
        };
        let key = self.binding()?.key();
        debug!(key, "query marked stale");
        store.set_state(patch(key, next));
        Ok(())
    }

    /// Move the freshness window from `previous` to a committed snapshot that
    /// is about to be written. Snapshots that were not committed pass through.
    pub(crate) fn arm(self: &Rc<Self>, previous: &Query, mut next: Query) -> Query {
        if next.rearm {
            next.stale_timer = self.restart_stale_timer(previous.stale_timer.as_ref());
            next.rearm = false;
        }
        next
    }

    /// Cancel `previous` and, if a stale time is configured, schedule a new
    /// timer.
    fn restart_stale_timer(self: &Rc<Self>, previous: Option<&AbortHandle>) -> Option<AbortHandle> {
        if let Some(timer) = previous {
            timer.abort();
        }
        let stale_time = self.settings().stale_time?;
        let def = Rc::clone(self);
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(stale_time).await;
            if let Err(error) = def.mark_stale() {
                warn!(query = %def.id, %error, "stale timer could not mark query stale");
            }
        });
        Some(handle.abort_handle())
    }
}

/// Snapshot of a query slot.
#[derive(Clone)]
pub struct Query {
    def: Rc<QueryDef>,
    outcome: Option<Outcome>,
    in_flight: Option<InFlight>,
    needs_load: bool,
    initialized: bool,
    value_timestamp: u64,
    stale_timer: Option<AbortHandle>,
    /// Committed but not yet written; the stale timer starts on write.
    rearm: bool,
    last_started_request: Option<Request>,
    last_completed_request: Option<Request>,
}

impl Query {
    /// Start building a query around `fetch`.
    ///
    /// The fetched value is stored as JSON; any `Serialize` type works.
    pub fn builder<F, Fut, T>(fetch: F) -> QueryBuilder
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<T, FetchError>> + 'static,
        T: Serialize + 'static,
    {
        let fetch: Box<FetchFn> = Box::new(move || {
            let fut = fetch();
            async move {
                let value = fut.await?;
                serde_json::to_value(value).map_err(FetchError::new)
            }
            .boxed_local()
        });
        QueryBuilder {
            fetch,
            deps: None,
            options: QueryOptions::default(),
            initial_value: None,
        }
    }

    pub fn id(&self) -> QueryId {
        self.def.id
    }

    /// The slot key, once bound.
    pub fn key(&self) -> Option<&str> {
        self.def.key()
    }

    pub fn value(&self) -> Option<&Data> {
        match &self.outcome {
            Some(Outcome::Value(value)) => Some(value),
            _ => None,
        }
    }

    /// Deserialize the cached value.
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.value()
            .map(|value| T::deserialize(value).map_err(Error::from))
            .transpose()
    }

    pub fn error(&self) -> Option<&FetchError> {
        match &self.outcome {
            Some(Outcome::Error(error)) => Some(error),
            _ => None,
        }
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn needs_load(&self) -> bool {
        self.needs_load
    }

    /// Whether dependency changes mark this query stale instead of
    /// refetching it.
    pub fn is_lazy(&self) -> bool {
        self.def.settings().lazy
    }

    /// Milliseconds since the Unix epoch of the last accepted write.
    pub fn value_timestamp(&self) -> u64 {
        self.value_timestamp
    }

    pub fn phase(&self) -> QueryPhase {
        if self.in_flight.is_some() {
            return QueryPhase::Loading;
        }
        if self.needs_load {
            return QueryPhase::Stale;
        }
        match &self.outcome {
            Some(Outcome::Value(_)) => QueryPhase::Success,
            Some(Outcome::Error(_)) => QueryPhase::Failed,
            None => QueryPhase::Idle,
        }
    }

    /// The in-flight attempt's future, if loading.
    pub fn promise(&self) -> Option<QueryPromise> {
        self.in_flight.as_ref().map(|f| f.promise.clone())
    }

    pub fn last_started_request(&self) -> Option<&Request> {
        self.last_started_request.as_ref()
    }

    pub fn last_completed_request(&self) -> Option<&Request> {
        self.last_completed_request.as_ref()
    }

    /// Evaluate the dependency list against `state`.
    pub fn dependencies(&self, state: &State) -> Deps {
        self.def.dependencies(state)
    }

    /// Start a fetch, or join the in-flight one inside the debounce window.
    pub fn trigger(&self) -> Result<QueryPromise> {
        self.def.trigger()
    }

    /// Mark the query stale. The cached value stays visible.
    pub fn mark_stale(&self) -> Result<()> {
        self.def.mark_stale()
    }

    /// Commit `value` and write it to the store.
    pub fn set_value(&self, value: impl Serialize) -> Result<Rc<Query>> {
        let value = serde_json::to_value(value)?;
        self.def.commit_live(Outcome::Value(value), Commit::default())
    }

    /// Commit `value` unless the query already holds a value written after
    /// `timestamp`.
    pub fn set_value_at(&self, value: impl Serialize, timestamp: u64) -> Result<Rc<Query>> {
        let value = serde_json::to_value(value)?;
        self.def.commit_live(Outcome::Value(value), Commit::at(timestamp))
    }

    /// Commit `value` only if the query has never been initialized.
    pub fn set_initial_value(&self, value: impl Serialize) -> Result<Rc<Query>> {
        let value = serde_json::to_value(value)?;
        self.def.commit_live(Outcome::Value(value), Commit::initial())
    }

    /// This snapshot with `value` committed. Nothing is written to the store.
    pub fn with_value(&self, value: impl Serialize) -> Result<Query> {
        let value = serde_json::to_value(value)?;
        Ok(self
            .commit(Outcome::Value(value), Commit::default())
            .unwrap_or_else(|| self.clone()))
    }

    pub(crate) fn def(&self) -> &Rc<QueryDef> {
        &self.def
    }

    pub(crate) fn settled(&self) -> Option<Settled> {
        self.in_flight.as_ref().map(|f| f.settled.clone())
    }

    /// Whether this snapshot came out of a commit that has not been written.
    pub(crate) fn needs_rearm(&self) -> bool {
        self.rearm
    }

    pub(crate) fn is_generation(&self, generation: u64) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|f| f.generation == generation)
    }

    /// The value-commit procedure. Returns `None` when the write is a no-op.
    ///
    /// Pure: the returned snapshot carries no stale timer. Whoever writes it
    /// to the store passes it through [`QueryDef::arm`].
    pub(crate) fn commit(&self, outcome: Outcome, commit: Commit) -> Option<Query> {
        let key = self.key().unwrap_or_default();
        if !self.is_loading() && self.error().is_none() {
            if let Outcome::Value(value) = &outcome {
                if self.value() == Some(value) {
                    trace!(key, "value unchanged");
                    return None;
                }
            }
        }
        if commit.initial && self.initialized {
            trace!(key, "already initialized");
            return None;
        }
        if let Some(timestamp) = commit.timestamp {
            if timestamp <= self.value_timestamp {
                trace!(key, timestamp, current = self.value_timestamp, "rejecting older write");
                return None;
            }
        }

        Some(Query {
            def: Rc::clone(&self.def),
            outcome: Some(outcome),
            in_flight: None,
            needs_load: false,
            initialized: true,
            value_timestamp: now_ms()
                .max(self.value_timestamp)
                .max(commit.timestamp.unwrap_or(0)),
            stale_timer: None,
            rearm: true,
            last_started_request: self.last_started_request.clone(),
            last_completed_request: commit
                .request
                .or_else(|| self.last_completed_request.clone()),
        })
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("id", &self.def.id)
            .field("key", &self.key())
            .field("phase", &self.phase())
            .field("outcome", &self.outcome)
            .field("value_timestamp", &self.value_timestamp)
            .finish()
    }
}

/// Builder for [`Query`].
pub struct QueryBuilder {
    fetch: Box<FetchFn>,
    deps: Option<Box<DepsFn>>,
    options: QueryOptions,
    initial_value: Option<serde_json::Result<Data>>,
}

impl QueryBuilder {
    /// Declare the dependencies whose changes invalidate this query.
    pub fn deps<F, I>(mut self, deps: F) -> Self
    where
        F: Fn(&State) -> I + 'static,
        I: IntoIterator<Item = Dep>,
    {
        self.deps = Some(Box::new(move |state: &State| deps(state).into_iter().collect()));
        self
    }

    pub fn lazy(mut self, lazy: bool) -> Self {
        self.options.lazy = Some(lazy);
        self
    }

    pub fn debounce(mut self, window: Duration) -> Self {
        self.options.debounce = Some(window);
        self
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.options.stale_time = Some(stale_time);
        self
    }

    /// Retry while the probed attempt number is below `attempts`.
    pub fn retry(mut self, attempts: u32) -> Self {
        self.options.retry = Some(RetryPolicy::Attempts(attempts));
        self
    }

    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(u32, &FetchError) -> bool + 'static,
    {
        self.options.retry = Some(RetryPolicy::custom(predicate));
        self
    }

    pub fn retry_delay<F>(mut self, delay: F) -> Self
    where
        F: Fn(u32) -> Duration + 'static,
    {
        self.options.retry_delay = Some(Rc::new(delay));
        self
    }

    pub fn initial_value<T: Serialize>(mut self, value: T) -> Self {
        self.initial_value = Some(serde_json::to_value(value));
        self
    }

    pub fn build(self) -> Result<Query> {
        if self.options.stale_time == Some(Duration::ZERO) {
            return Err(Error::InvalidConfig("stale time must be greater than zero".into()));
        }
        let initial = self
            .initial_value
            .transpose()
            .map_err(|e| Error::InvalidConfig(format!("initial value: {e}")))?;

        let def = Rc::new(QueryDef {
            id: QueryId::new(),
            binding: OnceCell::new(),
            fetch: self.fetch,
            deps: self.deps.unwrap_or_else(|| Box::new(|_: &State| Deps::new())),
            options: self.options,
            generation: Cell::new(0),
        });

        Ok(Query {
            def,
            needs_load: initial.is_none(),
            initialized: initial.is_some(),
            value_timestamp: if initial.is_some() { now_ms() } else { 0 },
            outcome: initial.map(Outcome::Value),
            in_flight: None,
            stale_timer: None,
            rearm: false,
            last_started_request: None,
            last_completed_request: None,
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{bound, flush, local};
    use serde_json::json;

    fn counted(calls: &Rc<Cell<u32>>, value: i64, delay_ms: u64) -> Query {
        let calls = calls.clone();
        Query::builder(move || {
            calls.set(calls.get() + 1);
            async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(value)
            }
        })
        .build()
        .unwrap()
    }

    #[test]
    fn new_query_needs_load() {
        let query = Query::builder(|| async { Ok(1) }).build().unwrap();
        assert!(query.needs_load());
        assert!(!query.is_initialized());
        assert!(!query.is_loading());
        assert_eq!(query.value(), None);
        assert_eq!(query.value_timestamp(), 0);
        assert_eq!(query.phase(), QueryPhase::Stale);
        assert_eq!(query.key(), None);
    }

    #[test]
    fn initial_value_initializes() {
        let query = Query::builder(|| async { Ok(1) })
            .initial_value(vec![1, 2])
            .build()
            .unwrap();
        assert!(!query.needs_load());
        assert!(query.is_initialized());
        assert!(query.value_timestamp() > 0);
        assert_eq!(query.value_as::<Vec<i32>>().unwrap(), Some(vec![1, 2]));
        assert_eq!(query.phase(), QueryPhase::Success);
    }

    #[test]
    fn defaults_apply_without_runtime() {
        let query = Query::builder(|| async { Ok(1) }).build().unwrap();
        let settings = query.def().settings();
        assert_eq!(settings.debounce, Duration::from_millis(300));
        assert!(settings.lazy);
        assert_eq!(settings.stale_time, None);
        assert!(matches!(settings.retry, RetryPolicy::Attempts(5)));
    }

    #[test]
    fn zero_stale_time_is_rejected() {
        let result = Query::builder(|| async { Ok(1) })
            .stale_time(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn unbound_trigger_fails() {
        let query = Query::builder(|| async { Ok(1) }).build().unwrap();
        assert!(matches!(query.trigger(), Err(Error::Unbound(_))));
        assert!(matches!(query.mark_stale(), Err(Error::Unbound(_))));
    }

    #[test]
    fn with_value_does_not_need_a_store() {
        let query = Query::builder(|| async { Ok(1) }).build().unwrap();
        let next = query.with_value(7).unwrap();
        assert_eq!(next.value(), Some(&json!(7)));
        assert!(next.is_initialized());
        assert!(!next.needs_load());
        assert_eq!(query.value(), None);
    }

    #[test]
    fn commit_clears_error_and_value_exclusively() {
        let query = Query::builder(|| async { Ok(1) }).initial_value(1).build().unwrap();
        let failed = query
            .commit(Outcome::Error(FetchError::msg("down")), Commit::default())
            .unwrap();
        assert_eq!(failed.value(), None);
        assert_eq!(failed.error(), Some(&FetchError::msg("down")));
        assert_eq!(failed.phase(), QueryPhase::Failed);

        let recovered = failed.commit(Outcome::Value(json!(1)), Commit::default()).unwrap();
        assert_eq!(recovered.value(), Some(&json!(1)));
        assert_eq!(recovered.error(), None);
    }

    #[test]
    fn commit_of_equal_value_is_a_no_op() {
        let query = Query::builder(|| async { Ok(1) })
            .initial_value(json!({"a": [1, 2]}))
            .build()
            .unwrap();
        assert!(query
            .commit(Outcome::Value(json!({"a": [1, 2]})), Commit::default())
            .is_none());
    }

    #[test]
    fn initial_value_applies_once() {
        let query = Query::builder(|| async { Ok(1) }).build().unwrap();
        let first = query.commit(Outcome::Value(json!(1)), Commit::initial()).unwrap();
        assert_eq!(first.value(), Some(&json!(1)));
        assert!(first.commit(Outcome::Value(json!(2)), Commit::initial()).is_none());
    }

    #[test]
    fn older_timestamps_are_rejected() {
        let query = Query::builder(|| async { Ok(1) }).build().unwrap();
        let t1 = now_ms();
        let newer = query.commit(Outcome::Value(json!("t1")), Commit::at(t1)).unwrap();
        assert!(newer.value_timestamp() >= t1);

        assert!(newer
            .commit(Outcome::Value(json!("t0")), Commit::at(t1 - 10))
            .is_none());
        assert!(newer
            .commit(Outcome::Value(json!("same")), Commit::at(newer.value_timestamp()))
            .is_none());

        // A timestamp ahead of the local clock is kept, so older writes stay
        // rejected until it has passed.
        let ahead = newer
            .commit(Outcome::Value(json!("t2")), Commit::at(t1 + 1_000))
            .unwrap();
        assert_eq!(ahead.value_timestamp(), t1 + 1_000);
        assert!(ahead
            .commit(Outcome::Value(json!("t1.5")), Commit::at(t1 + 500))
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_loads_and_commits() {
        local(async {
            let calls = Rc::new(Cell::new(0));
            let (_runtime, store) = bound(State::new().with("answer", counted(&calls, 42, 100)));
            let query = store.get_state().query("answer").unwrap().clone();

            let promise = query.trigger().unwrap();
            let loading = store.get_state().query("answer").unwrap().clone();
            assert!(loading.is_loading());
            assert!(!loading.needs_load());
            assert!(loading.is_initialized());
            assert_eq!(loading.phase(), QueryPhase::Loading);
            assert!(loading.last_started_request().unwrap().is_pending());

            assert_eq!(promise.await, Ok(json!(42)));
            flush().await;

            let settled = store.get_state().query("answer").unwrap().clone();
            assert_eq!(settled.value(), Some(&json!(42)));
            assert!(!settled.is_loading());
            assert_eq!(settled.phase(), QueryPhase::Success);
            assert!(settled.value_timestamp() > 0);
            assert_eq!(
                settled.last_completed_request().map(Request::status),
                Some(crate::engine::RequestStatus::Success)
            );
            assert_eq!(calls.get(), 1);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn triggers_inside_debounce_window_share_one_fetch() {
        local(async {
            let calls = Rc::new(Cell::new(0));
            let (_runtime, store) = bound(State::new().with("answer", counted(&calls, 1, 1_000)));
            let query = store.get_state().query("answer").unwrap().clone();

            let first = query.trigger().unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            let second = query.trigger().unwrap();
            assert!(first.ptr_eq(&second));

            tokio::time::sleep(Duration::from_millis(250)).await;
            let third = query.trigger().unwrap();
            assert!(!first.ptr_eq(&third));
            flush().await;
            assert_eq!(calls.get(), 2);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn mark_stale_keeps_value_visible() {
        local(async {
            let query = Query::builder(|| async { Ok(1) }).initial_value(5).build().unwrap();
            let (_runtime, store) = bound(State::new().with("q", query));

            store.get_state().query("q").unwrap().mark_stale().unwrap();
            let stale = store.get_state().query("q").unwrap().clone();
            assert!(stale.needs_load());
            assert_eq!(stale.value(), Some(&json!(5)));
            assert_eq!(stale.phase(), QueryPhase::Stale);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_marks_query_stale() {
        local(async {
            let query = Query::builder(|| async { Ok(3) })
                .stale_time(Duration::from_secs(5))
                .build()
                .unwrap();
            let (_runtime, store) = bound(State::new().with("q", query));
            let q = store.get_state().query("q").unwrap().clone();

            q.trigger().unwrap().await.unwrap();
            flush().await;
            assert!(!store.get_state().query("q").unwrap().needs_load());

            tokio::time::sleep(Duration::from_millis(5_010)).await;
            let stale = store.get_state().query("q").unwrap().clone();
            assert!(stale.needs_load());
            assert_eq!(stale.value(), Some(&json!(3)));
        })
        .await;
    }

    #[test]
    fn with_value_with_stale_time_runs_outside_a_local_set() {
        let query = Query::builder(|| async { Ok(1) })
            .stale_time(Duration::from_secs(1))
            .build()
            .unwrap();
        let next = query.with_value(7).unwrap();
        assert_eq!(next.value(), Some(&json!(7)));
        assert!(next.needs_rearm());
    }

    #[tokio::test(start_paused = true)]
    async fn discarded_with_value_leaves_the_freshness_window_alone() {
        local(async {
            let query = Query::builder(|| async { Ok(0) })
                .stale_time(Duration::from_millis(1_000))
                .build()
                .unwrap();
            let (_runtime, store) = bound(State::new().with("q", query));
            let q = || store.get_state().query("q").unwrap().clone();

            q().set_value(1).unwrap();
            let _ = q().with_value(2).unwrap();
            tokio::time::sleep(Duration::from_millis(900)).await;
            q().set_value(3).unwrap();

            tokio::time::sleep(Duration::from_millis(200)).await;
            assert!(!q().needs_load());
            assert_eq!(q().value(), Some(&json!(3)));

            tokio::time::sleep(Duration::from_millis(810)).await;
            assert!(q().needs_load());
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn set_value_writes_and_with_value_does_not() {
        local(async {
            let (_runtime, store) = bound(State::new().with("q", counted(&Rc::new(Cell::new(0)), 0, 0)));
            let q = store.get_state().query("q").unwrap().clone();

            let staged = q.with_value(1).unwrap();
            assert_eq!(staged.value(), Some(&json!(1)));
            assert_eq!(store.get_state().query("q").unwrap().value(), None);

            q.set_value(2).unwrap();
            assert_eq!(store.get_state().query("q").unwrap().value(), Some(&json!(2)));
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn dependency_without_value_gates_the_fetch() {
        local(async {
            let order = Rc::new(std::cell::RefCell::new(Vec::new()));
            let user_order = order.clone();
            let user = Query::builder(move || {
                let order = user_order.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    order.borrow_mut().push("user");
                    Ok(json!({"id": 7}))
                }
            })
            .build()
            .unwrap();
            let posts_order = order.clone();
            let posts = Query::builder(move || {
                let order = posts_order.clone();
                async move {
                    order.borrow_mut().push("posts");
                    Ok(vec!["hello"])
                }
            })
            .deps(|s: &State| [s.dep("user")])
            .build()
            .unwrap();

            let (_runtime, store) = bound(State::new().with("user", user).with("posts", posts));
            let promise = store.get_state().query("posts").unwrap().trigger().unwrap();

            assert!(store.get_state().query("user").unwrap().is_loading());
            assert_eq!(promise.await, Ok(json!(["hello"])));
            assert_eq!(*order.borrow(), vec!["user", "posts"]);
        })
        .await;
    }
}
