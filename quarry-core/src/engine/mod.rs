//! Query/effect engine.
//!
//! This module contains the store-facing runtime of queries and effects:
//!
//! - `query`: cached asynchronous reads with debouncing and supersession
//! - `effect`: concurrent asynchronous mutations
//! - `deps`: dependency lists and type-aware change detection
//! - `retry`: the bounded retry wrapper around fetches
//! - `request`: per-attempt request records
//! - `subscriber`: invalidation of queries after store transitions

mod deps;
mod effect;
mod query;
mod request;
pub mod retry;
pub(crate) mod subscriber;

use futures_util::future::{LocalBoxFuture, Shared};

pub use deps::{deps_equal, equals, Dep, Deps};
pub use effect::{Effect, EffectPromise};
pub use query::{Outcome, Query, QueryBuilder, QueryPhase, QueryPromise};
pub(crate) use query::Commit;
pub use request::{Request, RequestKind, RequestStatus, Response, Timing};
pub use retry::{default_retry_delay, RetryDelay, RetryPolicy};

/// Completes once an attempt's settlement has been applied to the store.
pub type Settled = Shared<LocalBoxFuture<'static, ()>>;
