//! Suspension results.

use std::fmt;
use std::future::{Future, IntoFuture};

use futures_util::future::{join_all, FutureExt, LocalBoxFuture};

use crate::engine::Settled;
use crate::error::Error;

/// Futures a suspended read is waiting on.
///
/// Awaiting it completes once every underlying attempt has settled and its
/// result is visible in the store. Reading again then returns the value.
#[derive(Default, Clone)]
pub struct Pending {
    waits: Vec<Settled>,
}

impl Pending {
    pub fn len(&self) -> usize {
        self.waits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waits.is_empty()
    }

    /// Take over every future of `other`.
    pub fn merge(&mut self, other: Pending) {
        self.waits.extend(other.waits);
    }

    pub(crate) fn push(&mut self, wait: Settled) {
        self.waits.push(wait);
    }
}

impl Extend<Settled> for Pending {
    fn extend<T: IntoIterator<Item = Settled>>(&mut self, iter: T) {
        self.waits.extend(iter);
    }
}

impl IntoFuture for Pending {
    type Output = ();
    type IntoFuture = LocalBoxFuture<'static, ()>;

    fn into_future(self) -> Self::IntoFuture {
        join_all(self.waits).map(drop).boxed_local()
    }
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending").field("waits", &self.waits.len()).finish()
    }
}

/// Why a suspending read did not produce a value.
#[derive(Debug)]
pub enum Suspense {
    /// Data is still loading. Await it and read again.
    Pending(Pending),
    /// The read failed: the query's fetch failed, or the selection is invalid.
    Failed(Error),
}

impl Suspense {
    pub fn is_pending(&self) -> bool {
        matches!(self, Suspense::Pending(_))
    }

    pub fn into_error(self) -> Option<Error> {
        match self {
            Suspense::Failed(error) => Some(error),
            Suspense::Pending(_) => None,
        }
    }

    /// Wait for the pending work; failures resolve immediately.
    pub fn wait(self) -> impl Future<Output = ()> {
        async move {
            if let Suspense::Pending(pending) = self {
                pending.await;
            }
        }
    }
}

impl From<Error> for Suspense {
    fn from(error: Error) -> Self {
        Suspense::Failed(error)
    }
}

impl fmt::Display for Suspense {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Suspense::Pending(pending) => write!(f, "waiting on {} pending attempts", pending.len()),
            Suspense::Failed(error) => write!(f, "{error}"),
        }
    }
}
