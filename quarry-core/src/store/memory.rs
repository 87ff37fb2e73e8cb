//! In-memory Store
//!
//! `MemoryStore` is the reference implementation of the [`Store`] trait. It
//! holds the current [`State`] and an ordered list of listeners.
//!
//! # How Writes Work
//!
//! 1. The patch is applied to a copy of the current state (copy-on-write).
//!
//! 2. The new state becomes current.
//!
//! 3. Every listener is called with `(new, old)`.
//!
//! # Reentrancy
//!
//! Listeners are allowed to write back into the store (the dependency
//! subscriber does this when it triggers or marks queries stale). No borrow
//! is held while listeners run, so nested writes are applied immediately and
//! notify listeners in turn.

use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;

use super::{Listener, Patch, Slot, State, Store};
use crate::ids::{ListenerId, StoreId};

/// A store living entirely in memory.
pub struct MemoryStore {
    /// Unique identifier for this store.
    id: StoreId,

    /// State the store was created with.
    initial: State,

    /// The current state.
    state: RefCell<State>,

    /// Registered listeners, in subscription order.
    listeners: RefCell<Vec<(ListenerId, Listener)>>,
}

impl MemoryStore {
    /// Create a new store with the given initial state.
    pub fn new(initial: State) -> Rc<Self> {
        Rc::new(Self {
            id: StoreId::new(),
            state: RefCell::new(initial.clone()),
            initial,
            listeners: RefCell::new(Vec::new()),
        })
    }

    /// Write a single slot.
    pub fn set(&self, key: impl Into<String>, slot: impl Into<Slot>) {
        self.set_state(Patch::from([(key.into(), slot.into())]));
    }

    /// Get the number of listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }
}

impl Store for MemoryStore {
    fn id(&self) -> StoreId {
        self.id
    }

    fn get_state(&self) -> State {
        self.state.borrow().clone()
    }

    fn get_initial_state(&self) -> State {
        self.initial.clone()
    }

    fn set_state(&self, patch: Patch) {
        if patch.is_empty() {
            return;
        }

        let (next, prev) = {
            let mut guard = self.state.borrow_mut();
            let prev = guard.clone();
            guard.apply(patch);
            (guard.clone(), prev)
        };

        // Snapshot the listener list so listeners may subscribe or
        // unsubscribe while being notified.
        let listeners: Vec<Listener> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, l)| Rc::clone(l))
            .collect();

        for listener in listeners {
            listener(&next, &prev);
        }
    }

    fn subscribe(&self, listener: Listener) -> ListenerId {
        let id = ListenerId::new();
        self.listeners.borrow_mut().push((id, listener));
        id
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }
}

impl Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("id", &self.id)
            .field("state", &self.get_state())
            .field("listener_count", &self.listener_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
