//! Store binding.
//!
//! Query and effect descriptors are created detached: they do not know which
//! store or slot they live in. The first time a store is subscribed, [`bind`]
//! walks its slots and attaches a [`Binding`] to every detached descriptor it
//! finds. A descriptor is bound at most once.

use std::rc::{Rc, Weak};

use tracing::debug;

use super::{Slot, State, Store};
use crate::error::{Error, Result};
use crate::runtime::RuntimeInner;

/// Where a descriptor lives: its slot key, its store and the runtime that
/// bound it.
pub(crate) struct Binding {
    key: String,
    store: Weak<dyn Store>,
    runtime: Weak<RuntimeInner>,
}

impl Binding {
    pub(crate) fn new(key: &str, store: &Rc<dyn Store>, runtime: Weak<RuntimeInner>) -> Self {
        Self {
            key: key.to_owned(),
            store: Rc::downgrade(store),
            runtime,
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    /// The owning store.
    pub(crate) fn store(&self) -> Result<Rc<dyn Store>> {
        self.store
            .upgrade()
            .ok_or_else(|| Error::StoreDropped(self.key.clone()))
    }

    /// The runtime that bound this descriptor, if it is still alive.
    pub(crate) fn runtime(&self) -> Option<Rc<RuntimeInner>> {
        self.runtime.upgrade()
    }
}

/// Bind every detached descriptor in `store` to its slot.
///
/// Walks the initial state's keys. For each key, the current slot is bound,
/// and so is the initial slot when the current one has been replaced since
/// (both snapshots may share one descriptor, or the initial one may be a
/// different descriptor that still needs a home).
///
/// Returns the number of descriptors newly bound.
pub(crate) fn bind(store: &Rc<dyn Store>, runtime: &Weak<RuntimeInner>) -> usize {
    let state = store.get_state();
    let initial = store.get_initial_state();
    let mut bound = 0;

    for (key, initial_slot) in initial.iter() {
        let current = state.get(key);
        if let Some(slot) = current {
            bound += attach(slot, key, store, runtime);
        }
        if !current.is_some_and(|slot| slot.same(initial_slot)) {
            bound += attach(initial_slot, key, store, runtime);
        }
    }

    debug!(store = %store.id(), bound, "bound store slots");
    bound
}

fn attach(slot: &Slot, key: &str, store: &Rc<dyn Store>, runtime: &Weak<RuntimeInner>) -> usize {
    let binding = || Binding::new(key, store, runtime.clone());
    let attached = match slot {
        Slot::Query(query) => query.def().bind(binding()),
        Slot::Effect(effect) => effect.def().bind(binding()),
        Slot::Data(_) => false,
    };
    usize::from(attached)
}

/// Look up the live query snapshot at `key`.
pub(crate) fn live_query(state: &State, key: &str) -> Result<Rc<crate::engine::Query>> {
    match state.get(key) {
        Some(Slot::Query(q)) => Ok(Rc::clone(q)),
        Some(_) => Err(Error::NotQuery(key.to_owned())),
        None => Err(Error::MissingSlot(key.to_owned())),
    }
}

/// Look up the live effect snapshot at `key`.
pub(crate) fn live_effect(state: &State, key: &str) -> Result<Rc<crate::engine::Effect>> {
    match state.get(key) {
        Some(Slot::Effect(e)) => Ok(Rc::clone(e)),
        Some(_) => Err(Error::NotEffect(key.to_owned())),
        None => Err(Error::MissingSlot(key.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Effect, Query};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn query() -> Query {
        Query::builder(|| async { Ok(1) }).build().unwrap()
    }

    fn effect() -> Effect {
        Effect::new(|_: ()| async { Ok(()) })
    }

    #[test]
    fn binds_queries_and_effects_to_their_keys() {
        let store = MemoryStore::new(
            State::new()
                .with("todos", query())
                .with("create", effect())
                .with("filter", json!("all")),
        );
        let dyn_store: Rc<dyn Store> = store.clone();

        assert_eq!(bind(&dyn_store, &Weak::new()), 2);

        let state = store.get_state();
        assert_eq!(state.query("todos").unwrap().key(), Some("todos"));
        assert_eq!(state.effect("create").unwrap().key(), Some("create"));
    }

    #[test]
    fn binding_is_idempotent() {
        let store = MemoryStore::new(State::new().with("todos", query()));
        let dyn_store: Rc<dyn Store> = store.clone();

        assert_eq!(bind(&dyn_store, &Weak::new()), 1);
        assert_eq!(bind(&dyn_store, &Weak::new()), 0);
    }

    #[test]
    fn binds_replaced_current_slot() {
        let store = MemoryStore::new(State::new().with("todos", query()));
        // Replace the slot with a different descriptor before binding.
        store.set("todos", query());
        let dyn_store: Rc<dyn Store> = store.clone();

        assert_eq!(bind(&dyn_store, &Weak::new()), 2);
        assert_eq!(store.get_initial_state().query("todos").unwrap().key(), Some("todos"));
        assert_eq!(store.get_state().query("todos").unwrap().key(), Some("todos"));
    }

    #[test]
    fn store_accessor_fails_after_drop() {
        let store = MemoryStore::new(State::new());
        let dyn_store: Rc<dyn Store> = store;
        let binding = Binding::new("todos", &dyn_store, Weak::new());
        assert!(binding.store().is_ok());

        drop(dyn_store);
        assert!(matches!(binding.store(), Err(Error::StoreDropped(key)) if key == "todos"));
    }
}
