//! Dependency subscriber.
//!
//! Runs after every store transition. For each query slot it evaluates the
//! dependency list against the new and the old state; when the lists differ
//! the query is invalidated:
//!
//! - mounted queries are refetched,
//! - otherwise non-lazy queries are refetched,
//! - otherwise the query is only marked stale.
//!
//! Invalidation failures are logged and never reach the writer whose
//! transition caused them.

use std::rc::Rc;

use tracing::{trace, warn};

use super::deps::{deps_equal, Deps};
use super::query::QueryDef;
use crate::ids::QueryId;
use crate::store::{Slot, State};

/// What to do with a query whose inputs changed.
pub(crate) enum Invalidation {
    Trigger(Rc<QueryDef>),
    MarkStale(Rc<QueryDef>),
}

impl Invalidation {
    fn def(&self) -> &Rc<QueryDef> {
        match self {
            Invalidation::Trigger(def) | Invalidation::MarkStale(def) => def,
        }
    }
}

/// Decide which queries the transition `prev -> next` invalidates.
pub(crate) fn invalidations<M>(next: &State, prev: &State, is_mounted: M) -> Vec<Invalidation>
where
    M: Fn(QueryId) -> bool,
{
    let mut out = Vec::new();
    for (key, slot) in next.iter() {
        let Slot::Query(query) = slot else { continue };

        let next_deps = query.dependencies(next);
        let prev_deps = match prev.get(key) {
            Some(Slot::Query(previous)) => previous.dependencies(prev),
            _ => Deps::new(),
        };
        if deps_equal(&next_deps, &prev_deps) {
            continue;
        }

        let def = Rc::clone(query.def());
        if is_mounted(query.id()) || !query.is_lazy() {
            trace!(key, "dependencies changed, refetching");
            out.push(Invalidation::Trigger(def));
        } else {
            trace!(key, "dependencies changed, marking stale");
            out.push(Invalidation::MarkStale(def));
        }
    }
    out
}

/// Carry out invalidations. Errors are logged.
pub(crate) fn apply(invalidations: Vec<Invalidation>) {
    for invalidation in invalidations {
        let result = match &invalidation {
            Invalidation::Trigger(def) => def.trigger().map(drop),
            Invalidation::MarkStale(def) => def.mark_stale(),
        };
        if let Err(error) = result {
            warn!(
                query = %invalidation.def().id(),
                key = invalidation.def().key().unwrap_or_default(),
                %error,
                "invalidation failed"
            );
        }
    }
}
