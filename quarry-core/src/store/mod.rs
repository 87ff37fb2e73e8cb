//! Stores and Slots
//!
//! A store is a mapping from slot names to slot values. The engine does not
//! own stores: it talks to them through the [`Store`] trait, which mirrors
//! the four primitives every reactive store offers (read state, read initial
//! state, write a partial state, subscribe to transitions).
//!
//! # Slots
//!
//! A [`Slot`] holds one of:
//!
//! - a [`Query`] snapshot,
//! - an [`Effect`] snapshot,
//! - plain application [`Data`].
//!
//! Query and effect snapshots are immutable. Every state change produces a
//! new snapshot which replaces the whole slot, so a subscriber always sees a
//! consistent slot value.
//!
//! # State
//!
//! [`State`] is a cheaply clonable snapshot of every slot. Writes go through
//! [`Store::set_state`] with a [`Patch`] naming only the slots that change.

mod binding;
mod memory;

pub(crate) use binding::{bind, live_effect, live_query, Binding};
pub use memory::MemoryStore;

use std::rc::Rc;

use indexmap::IndexMap;

use crate::engine::{Dep, Effect, Query};
use crate::ids::{ListenerId, StoreId};

/// Plain slot data and query values.
pub type Data = serde_json::Value;

/// A partial state: the slots to replace.
pub type Patch = IndexMap<String, Slot>;

/// Callback invoked with `(new_state, old_state)` after every write.
pub type Listener = Rc<dyn Fn(&State, &State)>;

/// The reactive store collaborator.
pub trait Store {
    /// Unique identity of this store instance.
    fn id(&self) -> StoreId;

    /// The current state.
    fn get_state(&self) -> State;

    /// The state the store was created with.
    fn get_initial_state(&self) -> State;

    /// Replace the slots named in `patch` and notify listeners.
    fn set_state(&self, patch: Patch);

    /// Register a listener for state transitions.
    fn subscribe(&self, listener: Listener) -> ListenerId;

    /// Remove a listener. Returns whether it was registered.
    fn unsubscribe(&self, id: ListenerId) -> bool;
}

/// Value held by a slot.
#[derive(Clone, Debug)]
pub enum Slot {
    Query(Rc<Query>),
    Effect(Rc<Effect>),
    Data(Data),
}

impl Slot {
    /// Whether two slots are the same value by identity.
    ///
    /// Queries and effects compare by snapshot pointer; data compares by
    /// equality.
    pub fn same(&self, other: &Slot) -> bool {
        match (self, other) {
            (Slot::Query(a), Slot::Query(b)) => Rc::ptr_eq(a, b),
            (Slot::Effect(a), Slot::Effect(b)) => Rc::ptr_eq(a, b),
            (Slot::Data(a), Slot::Data(b)) => a == b,
            _ => false,
        }
    }

    pub fn as_query(&self) -> Option<&Rc<Query>> {
        match self {
            Slot::Query(q) => Some(q),
            _ => None,
        }
    }

    pub fn as_effect(&self) -> Option<&Rc<Effect>> {
        match self {
            Slot::Effect(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&Data> {
        match self {
            Slot::Data(d) => Some(d),
            _ => None,
        }
    }
}

impl From<Query> for Slot {
    fn from(query: Query) -> Self {
        Slot::Query(Rc::new(query))
    }
}

impl From<Rc<Query>> for Slot {
    fn from(query: Rc<Query>) -> Self {
        Slot::Query(query)
    }
}

impl From<Effect> for Slot {
    fn from(effect: Effect) -> Self {
        Slot::Effect(Rc::new(effect))
    }
}

impl From<Rc<Effect>> for Slot {
    fn from(effect: Rc<Effect>) -> Self {
        Slot::Effect(effect)
    }
}

impl From<Data> for Slot {
    fn from(data: Data) -> Self {
        Slot::Data(data)
    }
}

/// Immutable snapshot of every slot in a store.
#[derive(Clone, Default)]
pub struct State {
    slots: Rc<IndexMap<String, Slot>>,
}

impl State {
    /// An empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a slot, builder style.
    pub fn with(mut self, key: impl Into<String>, slot: impl Into<Slot>) -> Self {
        Rc::make_mut(&mut self.slots).insert(key.into(), slot.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Slot> {
        self.slots.get(key)
    }

    pub fn query(&self, key: &str) -> Option<&Rc<Query>> {
        self.get(key).and_then(Slot::as_query)
    }

    pub fn effect(&self, key: &str) -> Option<&Rc<Effect>> {
        self.get(key).and_then(Slot::as_effect)
    }

    pub fn data(&self, key: &str) -> Option<&Data> {
        self.get(key).and_then(Slot::as_data)
    }

    /// The slot at `key` as a dependency. Missing slots read as `null`.
    pub fn dep(&self, key: &str) -> Dep {
        self.get(key)
            .cloned()
            .map(Dep::from)
            .unwrap_or(Dep::Data(Data::Null))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Slot)> {
        self.slots.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Replace the slots named in `patch`, keeping insertion order for
    /// existing keys.
    pub(crate) fn apply(&mut self, patch: Patch) {
        let slots = Rc::make_mut(&mut self.slots);
        for (key, slot) in patch {
            slots.insert(key, slot);
        }
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.slots.iter()).finish()
    }
}

impl<K: Into<String>, S: Into<Slot>> FromIterator<(K, S)> for State {
    fn from_iter<I: IntoIterator<Item = (K, S)>>(iter: I) -> Self {
        Self {
            slots: Rc::new(
                iter.into_iter()
                    .map(|(k, s)| (k.into(), s.into()))
                    .collect(),
            ),
        }
    }
}

/// A patch writing a single slot.
pub(crate) fn patch(key: &str, slot: impl Into<Slot>) -> Patch {
    Patch::from([(key.to_owned(), slot.into())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_builder_and_lookup() {
        let state = State::new()
            .with("filter", json!("all"))
            .with("count", json!(3));

        assert_eq!(state.len(), 2);
        assert_eq!(state.data("filter"), Some(&json!("all")));
        assert!(state.query("filter").is_none());
        assert!(state.get("missing").is_none());
        assert_eq!(state.keys().collect::<Vec<_>>(), vec!["filter", "count"]);
    }

    #[test]
    fn apply_is_copy_on_write() {
        let before = State::new().with("a", json!(1));
        let mut after = before.clone();
        after.apply(patch("a", json!(2)));

        assert_eq!(before.data("a"), Some(&json!(1)));
        assert_eq!(after.data("a"), Some(&json!(2)));
    }

    #[test]
    fn missing_dep_reads_null() {
        let state = State::new();
        assert!(matches!(state.dep("nope"), Dep::Data(Data::Null)));
    }

    #[test]
    fn collect_into_state() {
        let state: State = [("x", json!(1)), ("y", json!(2))].into_iter().collect();
        assert_eq!(state.data("y"), Some(&json!(2)));
    }
}
