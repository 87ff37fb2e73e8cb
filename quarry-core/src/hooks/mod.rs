//! Consumption Layer
//!
//! [`Hooks`] is how application code reads queries and effects out of a
//! store. Reads come in two forms:
//!
//! - suspending reads (`suspend*`) return the value, or a [`Suspense`]
//!   telling the caller what to wait on before reading again;
//! - non-suspending reads (`read*`) never block and return a [`QueryView`]
//!   with loading and error flags.
//!
//! Both forms start a fetch when the query needs one, reusing the in-flight
//! attempt when there is one.
//!
//! # Read options
//!
//! [`ReadOptions`] lets a read seed the query instead of fetching it: an
//! initial value (applied once, ever) or a server value with the timestamp it
//! was produced at (applied when newer than the cached value). A hydration
//! future replaces the query's own fetch as the thing to wait on.

mod mount;
mod suspense;

pub use mount::Mount;
pub use suspense::{Pending, Suspense};

use std::fmt;
use std::future::Future;
use std::rc::Rc;

use futures_util::future::FutureExt;
use serde::de::DeserializeOwned;

use crate::engine::{Commit, Dep, Effect, Outcome, Query, Request, Settled};
use crate::error::{Error, FetchError, Result};
use crate::runtime::Runtime;
use crate::store::{Data, Slot, State, Store};

/// Future gating a read until persisted state has been restored.
pub type Hydration = Settled;

/// Wrap `future` as a [`Hydration`].
pub fn hydration<F>(future: F) -> Hydration
where
    F: Future<Output = ()> + 'static,
{
    future.boxed_local().shared()
}

/// Options for a single query read.
#[derive(Clone)]
pub struct ReadOptions {
    initial_value: Option<Data>,
    value: Option<Data>,
    timestamp: Option<u64>,
    hydration: Option<Hydration>,
    follow_deps: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            initial_value: None,
            value: None,
            timestamp: None,
            hydration: None,
            follow_deps: true,
        }
    }
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a never-initialized query with `value` instead of fetching.
    pub fn initial_value(mut self, value: Data) -> Self {
        self.initial_value = Some(value);
        self
    }

    /// Seed the query with a server value. Requires [`timestamp`].
    ///
    /// [`timestamp`]: ReadOptions::timestamp
    pub fn value(mut self, value: Data) -> Self {
        self.value = Some(value);
        self
    }

    /// When the server value was produced, in milliseconds since the epoch.
    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Wait on `hydration` instead of triggering the query.
    pub fn hydration(mut self, hydration: Hydration) -> Self {
        self.hydration = Some(hydration);
        self
    }

    /// Whether to also wait on in-flight dependencies.
    pub fn follow_deps(mut self, follow: bool) -> Self {
        self.follow_deps = follow;
        self
    }

    fn validate(&self) -> Result<()> {
        match (&self.value, self.timestamp) {
            (Some(_), None) => Err(Error::ValueWithoutTimestamp),
            (None, Some(_)) => Err(Error::TimestampWithoutValue),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for ReadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOptions")
            .field("initial_value", &self.initial_value)
            .field("value", &self.value)
            .field("timestamp", &self.timestamp)
            .field("hydration", &self.hydration.is_some())
            .field("follow_deps", &self.follow_deps)
            .finish()
    }
}

/// Non-suspending view of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryView {
    pub value: Option<Data>,
    pub is_loading: bool,
    pub error: Option<FetchError>,
    pub last_completed_request: Option<Request>,
}

struct Resolution {
    view: QueryView,
    pending: Pending,
}

/// Read access to one store.
#[derive(Clone)]
pub struct Hooks {
    runtime: Runtime,
    store: Rc<dyn Store>,
}

impl Hooks {
    pub(crate) fn new(runtime: Runtime, store: Rc<dyn Store>) -> Self {
        Self { runtime, store }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn store(&self) -> &Rc<dyn Store> {
        &self.store
    }

    /// Read the query at `key`, suspending while it loads.
    pub fn suspend(&self, key: &str, options: &ReadOptions) -> Result<Option<Data>, Suspense> {
        let state = self.store.get_state();
        let query = query_at(&state, key)?;
        let Resolution { view, pending } = self.resolve(&state, &query, options)?;
        if !pending.is_empty() {
            return Err(Suspense::Pending(pending));
        }
        match view.error {
            Some(error) => Err(Suspense::Failed(Error::Fetch(error))),
            None => Ok(view.value),
        }
    }

    /// [`suspend`](Hooks::suspend), deserializing the value.
    pub fn suspend_as<T: DeserializeOwned>(
        &self,
        key: &str,
        options: &ReadOptions,
    ) -> Result<Option<T>, Suspense> {
        self.suspend(key, options)?
            .map(|value| T::deserialize(value).map_err(|e| Suspense::Failed(e.into())))
            .transpose()
    }

    /// The effect at `key`, suspending while any of its runs is in flight.
    pub fn suspend_effect(&self, key: &str) -> Result<Rc<Effect>, Suspense> {
        let effect = effect_at(&self.store.get_state(), key)?;
        let mut pending = Pending::default();
        pending.extend(effect.settled());
        if pending.is_empty() {
            Ok(effect)
        } else {
            Err(Suspense::Pending(pending))
        }
    }

    /// Read several queries at once.
    ///
    /// Every selection is resolved (and triggered if needed) first. Then a
    /// failed query fails the whole read; otherwise, if any query is loading,
    /// the result waits on all of them together.
    pub fn suspend_all(
        &self,
        selections: &[(&str, ReadOptions)],
    ) -> Result<Vec<Option<Data>>, Suspense> {
        let state = self.store.get_state();
        let mut values = Vec::with_capacity(selections.len());
        let mut pending = Pending::default();
        let mut failed = None;

        for (key, options) in selections {
            let query = query_at(&state, key)?;
            let resolution = self.resolve(&state, &query, options)?;
            if resolution.pending.is_empty() && failed.is_none() {
                failed = resolution.view.error;
            }
            pending.merge(resolution.pending);
            values.push(resolution.view.value);
        }

        if let Some(error) = failed {
            return Err(Suspense::Failed(Error::Fetch(error)));
        }
        if pending.is_empty() {
            Ok(values)
        } else {
            Err(Suspense::Pending(pending))
        }
    }

    /// Read the query at `key` without suspending.
    pub fn read(&self, key: &str, options: &ReadOptions) -> Result<QueryView> {
        let state = self.store.get_state();
        let query = query_at(&state, key)?;
        Ok(self.resolve(&state, &query, options)?.view)
    }

    /// Read several queries without suspending.
    pub fn read_all(&self, selections: &[(&str, ReadOptions)]) -> Result<Vec<QueryView>> {
        selections
            .iter()
            .map(|(key, options)| self.read(key, options))
            .collect()
    }

    /// The effect at `key`, whatever its state.
    pub fn read_effect(&self, key: &str) -> Result<Rc<Effect>> {
        effect_at(&self.store.get_state(), key)
    }

    /// Mark the query at `key` as mounted until the guard is dropped.
    pub fn mount(&self, key: &str) -> Result<Mount> {
        let query = query_at(&self.store.get_state(), key)?;
        Ok(Mount::new(Rc::downgrade(self.runtime.inner()), query.id()))
    }

    fn resolve(&self, state: &State, query: &Rc<Query>, options: &ReadOptions) -> Result<Resolution> {
        options.validate()?;
        let mut pending = Pending::default();

        if !query.is_initialized() {
            if let Some(initial) = &options.initial_value {
                let live = query
                    .def()
                    .commit_live(Outcome::Value(initial.clone()), Commit::initial())?;
                return Ok(Resolution {
                    view: seeded(initial, &live),
                    pending,
                });
            }
        }

        if let (Some(value), Some(timestamp)) = (&options.value, options.timestamp) {
            if query.value_timestamp() < timestamp {
                let live = query
                    .def()
                    .commit_live(Outcome::Value(value.clone()), Commit::at(timestamp))?;
                return Ok(Resolution {
                    view: seeded(value, &live),
                    pending,
                });
            }
        }

        if query.needs_load() || query.is_loading() {
            if let Some(hydration) = &options.hydration {
                pending.push(hydration.clone());
            } else if let Some(settled) = query.settled() {
                pending.push(settled);
            } else {
                pending.push(query.def().start()?.settled);
            }
        }

        if options.follow_deps && options.hydration.is_none() {
            for dep in query.dependencies(state) {
                match dep {
                    Dep::Query(q) => pending.extend(q.settled()),
                    Dep::Effect(e) => pending.extend(e.settled()),
                    Dep::Data(_) | Dep::List(_) => {}
                }
            }
        }

        Ok(Resolution {
            view: QueryView {
                value: query.value().cloned(),
                is_loading: !pending.is_empty(),
                error: query.error().cloned(),
                last_completed_request: query.last_completed_request().cloned(),
            },
            pending,
        })
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks").field("store", &self.store.id()).finish()
    }
}

fn seeded(value: &Data, live: &Query) -> QueryView {
    QueryView {
        value: Some(value.clone()),
        is_loading: false,
        error: None,
        last_completed_request: live.last_completed_request().cloned(),
    }
}

fn query_at(state: &State, key: &str) -> Result<Rc<Query>> {
    match state.get(key) {
        Some(Slot::Query(q)) => Ok(Rc::clone(q)),
        Some(Slot::Effect(_)) => Err(Error::NotQuery(key.to_owned())),
        Some(Slot::Data(_)) => Err(Error::NotQueryOrEffect(key.to_owned())),
        None => Err(Error::MissingSlot(key.to_owned())),
    }
}

fn effect_at(state: &State, key: &str) -> Result<Rc<Effect>> {
    match state.get(key) {
        Some(Slot::Effect(e)) => Ok(Rc::clone(e)),
        Some(Slot::Query(_)) => Err(Error::NotEffect(key.to_owned())),
        Some(Slot::Data(_)) => Err(Error::NotQueryOrEffect(key.to_owned())),
        None => Err(Error::MissingSlot(key.to_owned())),
    }
}
