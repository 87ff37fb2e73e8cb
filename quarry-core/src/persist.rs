//! Persistence
//!
//! Saves a store's state to a key-value [`Storage`] and restores it later.
//!
//! # What Is Saved
//!
//! [`partialize`] turns a state into a JSON object:
//!
//! - a query slot becomes `{"value": v}`, or `{}` when it has no value;
//! - an effect slot is left out;
//! - plain data is saved as is.
//!
//! # Restoring
//!
//! [`merge`] combines the saved object with the store's current state.
//! Query and effect descriptors always come from the current state, since
//! functions cannot be persisted. A saved query value is committed into the
//! current query snapshot without writing to the store; everything else the
//! snapshot holds (loading state, requests) starts fresh. Saved plain data
//! overrides the current value.
//!
//! # Hydration
//!
//! [`Persister::rehydrate`] reads the saved state once and writes the merged
//! result to the store, starting the stale timers of restored queries (so it
//! needs a `LocalSet` when any of them has a stale time). Until it completes, [`Persister::hydration`] futures
//! stay pending; pass one as a read option to hold back fetches that would
//! otherwise race the restored values.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::engine::{Commit, Outcome};
use crate::error::{Error, Result};
use crate::hooks::{hydration, Hydration};
use crate::ids::ListenerId;
use crate::store::{Data, Patch, Slot, State, Store};

/// Restores a saved object into the current state.
pub type MergeFn = fn(&Data, &State) -> State;

/// Selects what to save from a state.
pub type PartializeFn = fn(&State) -> Data;

/// Key-value storage for persisted state.
pub trait Storage: Send + Sync {
    fn get_item(&self, name: &str) -> Result<Option<Vec<u8>>>;
    fn set_item(&self, name: &str, value: Vec<u8>) -> Result<()>;
    fn remove_item(&self, name: &str) -> Result<()>;
}

/// Storage held in memory. Can be shared across threads.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get_item(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.items.read().get(name).cloned())
    }

    fn set_item(&self, name: &str, value: Vec<u8>) -> Result<()> {
        self.items.write().insert(name.to_owned(), value);
        Ok(())
    }

    fn remove_item(&self, name: &str) -> Result<()> {
        self.items.write().remove(name);
        Ok(())
    }
}

/// Serialization format of saved state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Json,
    MessagePack,
}

impl Codec {
    pub fn encode(&self, data: &Data) -> Result<Vec<u8>> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(data)?),
            Codec::MessagePack => Ok(rmp_serde::to_vec_named(data)?),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Data> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
            Codec::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }
}

/// Default partialize: query values and plain data, no effects.
pub fn partialize(state: &State) -> Data {
    let mut out = Map::new();
    for (key, slot) in state.iter() {
        match slot {
            Slot::Query(query) => {
                let mut saved = Map::new();
                if let Some(value) = query.value() {
                    saved.insert("value".to_owned(), value.clone());
                }
                out.insert(key.to_owned(), Data::Object(saved));
            }
            Slot::Effect(_) => {}
            Slot::Data(data) => {
                out.insert(key.to_owned(), data.clone());
            }
        }
    }
    Data::Object(out)
}

/// Default merge: restore saved query values into the current descriptors.
pub fn merge(persisted: &Data, current: &State) -> State {
    let saved = persisted.as_object();
    let mut patch = Patch::new();

    if let Some(saved) = saved {
        for (key, value) in saved {
            if !matches!(current.get(key), Some(Slot::Query(_) | Slot::Effect(_))) {
                patch.insert(key.clone(), Slot::Data(value.clone()));
            }
        }
    }

    for (key, slot) in current.iter() {
        let Slot::Query(query) = slot else { continue };
        let restored = saved
            .and_then(|saved| saved.get(key))
            .and_then(Data::as_object)
            .and_then(|saved| saved.get("value"));
        let Some(value) = restored else { continue };
        if let Some(next) = query.commit(Outcome::Value(value.clone()), Commit::default()) {
            patch.insert(key.to_owned(), Slot::Query(Rc::new(next)));
        }
    }

    let mut merged = current.clone();
    merged.apply(patch);
    merged
}

/// Start the stale timer of a restored query now that it is being written.
fn arm(previous: &State, key: &str, slot: &Slot) -> Slot {
    match (slot, previous.get(key)) {
        (Slot::Query(next), Some(Slot::Query(before))) if next.needs_rearm() => {
            Slot::Query(Rc::new(next.def().arm(before, (**next).clone())))
        }
        _ => slot.clone(),
    }
}

/// Persistence options.
#[derive(Debug, Clone)]
pub struct PersistOptions {
    /// Storage key.
    pub name: String,
    pub codec: Codec,
    pub merge: Option<MergeFn>,
    pub partialize: Option<PartializeFn>,
}

impl PersistOptions {
    /// Options with the default merge and partialize functions.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            codec: Codec::default(),
            merge: Some(merge),
            partialize: Some(partialize),
        }
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }
}

/// Saves and restores one store.
pub struct Persister {
    name: String,
    codec: Codec,
    merge: MergeFn,
    partialize: PartializeFn,
    storage: Arc<dyn Storage>,
    hydrated: Cell<bool>,
    gate: watch::Sender<bool>,
}

impl Persister {
    pub fn new(options: PersistOptions, storage: Arc<dyn Storage>) -> Result<Self> {
        let merge = options.merge.ok_or(Error::MissingPersistFn("merge"))?;
        let partialize = options
            .partialize
            .ok_or(Error::MissingPersistFn("partialize"))?;
        let (gate, _) = watch::channel(false);
        Ok(Self {
            name: options.name,
            codec: options.codec,
            merge,
            partialize,
            storage,
            hydrated: Cell::new(false),
            gate,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Save `state` now.
    pub fn save(&self, state: &State) -> Result<()> {
        let bytes = self.codec.encode(&(self.partialize)(state))?;
        self.storage.set_item(&self.name, bytes)?;
        debug!(name = %self.name, "state saved");
        Ok(())
    }

    /// Save the store after every change.
    pub fn attach<S: Store + ?Sized>(self: &Rc<Self>, store: &S) -> ListenerId {
        let persister = Rc::clone(self);
        store.subscribe(Rc::new(move |next: &State, _: &State| {
            if let Err(error) = persister.save(next) {
                warn!(name = %persister.name, %error, "could not save state");
            }
        }))
    }

    /// Restore saved state into `store`. Returns whether anything was saved.
    ///
    /// Fails with [`Error::AlreadyHydrated`] once hydration has completed.
    pub fn rehydrate<S: Store + ?Sized>(&self, store: &S) -> Result<bool> {
        if self.hydrated.get() {
            return Err(Error::AlreadyHydrated);
        }
        let restored = match self.storage.get_item(&self.name)? {
            Some(bytes) => {
                let saved = self.codec.decode(&bytes)?;
                let previous = store.get_state();
                let merged = (self.merge)(&saved, &previous);
                store.set_state(
                    merged
                        .iter()
                        .map(|(key, slot)| (key.to_owned(), arm(&previous, key, slot)))
                        .collect(),
                );
                true
            }
            None => false,
        };
        self.hydrated.set(true);
        self.gate.send_replace(true);
        info!(name = %self.name, restored, "store hydrated");
        Ok(restored)
    }

    pub fn has_hydrated(&self) -> bool {
        self.hydrated.get()
    }

    /// Completes once hydration has finished (or the persister is dropped).
    pub fn hydration(&self) -> Hydration {
        let mut done = self.gate.subscribe();
        hydration(async move {
            let _ = done.wait_for(|hydrated| *hydrated).await;
        })
    }

    /// Delete the saved state.
    pub fn clear(&self) -> Result<()> {
        self.storage.remove_item(&self.name)
    }
}

impl fmt::Debug for Persister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persister")
            .field("name", &self.name)
            .field("codec", &self.codec)
            .field("hydrated", &self.hydrated.get())
            .finish()
    }
}
