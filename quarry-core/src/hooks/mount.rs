//! Mount guards.

use std::fmt;
use std::rc::Weak;

use crate::ids::QueryId;
use crate::runtime::RuntimeInner;

/// Keeps a query mounted while alive.
///
/// A mounted query is refetched when its dependencies change, even if it is
/// lazy. Dropping the guard unmounts it.
#[must_use = "the query is unmounted when the guard is dropped"]
pub struct Mount {
    runtime: Weak<RuntimeInner>,
    query: QueryId,
}

impl Mount {
    pub(crate) fn new(runtime: Weak<RuntimeInner>, query: QueryId) -> Self {
        if let Some(runtime) = runtime.upgrade() {
            runtime.mount(query);
        }
        Self { runtime, query }
    }

    pub fn query(&self) -> QueryId {
        self.query
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.unmount(self.query);
        }
    }
}

impl fmt::Debug for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Mount").field(&self.query).finish()
    }
}
