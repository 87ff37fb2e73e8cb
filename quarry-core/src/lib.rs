//! Quarry Core
//!
//! This crate provides a reactive data-fetching layer on top of a shared
//! key-value store. It implements:
//!
//! - Queries: cached asynchronous reads with debouncing, retries, staleness
//!   and dependency-driven invalidation
//! - Effects: concurrent asynchronous mutations that invalidate dependent
//!   queries when they complete
//! - Consumption hooks: suspending and non-suspending reads
//! - Persistence of query values across sessions
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `store`: the store trait, slots and an in-memory store
//! - `engine`: queries, effects, dependency diffing and the retry engine
//! - `runtime`: binds stores and invalidates queries on every transition
//! - `hooks`: the consumption layer
//! - `events`: completion events
//! - `persist`: saving and restoring store state
//!
//! Everything is single-threaded. Operations that start fetches must run
//! inside a [`tokio::task::LocalSet`].
//!
//! # Example
//!
//! ```rust,ignore
//! use quarry_core::{Effect, MemoryStore, Query, ReadOptions, Runtime, State};
//!
//! let todos = Query::builder(|| async { api::list_todos().await })
//!     .deps(|s: &State| [s.dep("create")])
//!     .build()?;
//! let create = Effect::new(|title: String| async move { api::create(title).await });
//!
//! let store = MemoryStore::new(State::new().with("todos", todos).with("create", create));
//! let runtime = Runtime::new();
//! let hooks = runtime.hooks(&store);
//!
//! // Suspends until the first fetch settles.
//! if let Err(suspense) = hooks.suspend("todos", &ReadOptions::new()) {
//!     suspense.wait().await;
//! }
//!
//! // Completing the effect marks `todos` stale.
//! hooks.read_effect("create")?.trigger("milk")?.await?;
//! ```

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod hooks;
pub mod ids;
pub mod persist;
pub mod runtime;
pub mod store;

pub use config::{EffectDefaults, QueryDefaults, RuntimeConfig};
pub use engine::{
    Dep, Deps, Effect, EffectPromise, Outcome, Query, QueryBuilder, QueryPhase, QueryPromise,
    Request, RequestStatus, RetryPolicy,
};
pub use error::{Error, FetchError, Result};
pub use events::{Event, EventBus, EventKind, EventSource, Scope};
pub use hooks::{hydration, Hooks, Mount, Pending, QueryView, ReadOptions, Suspense};
pub use ids::{EffectId, ListenerId, QueryId, RequestId, StoreId};
pub use persist::{Codec, MemoryStorage, PersistOptions, Persister, Storage};
pub use runtime::Runtime;
pub use store::{Data, MemoryStore, Slot, State, Store};

#[cfg(test)]
pub(crate) mod testing {
    use std::future::Future;
    use std::rc::Rc;
    use std::time::Duration;

    use crate::runtime::Runtime;
    use crate::store::{MemoryStore, State};

    /// Run `future` inside a `LocalSet`.
    pub(crate) async fn local<F: Future>(future: F) -> F::Output {
        tokio::task::LocalSet::new().run_until(future).await
    }

    /// Let spawned settlements run.
    pub(crate) async fn flush() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    /// A memory store subscribed to a fresh runtime.
    pub(crate) fn bound(state: State) -> (Runtime, Rc<MemoryStore>) {
        let store = MemoryStore::new(state);
        let runtime = Runtime::new();
        runtime.subscribe(&store);
        (runtime, store)
    }
}
