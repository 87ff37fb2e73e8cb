//! Identifier types.
//!
//! Every query, effect, store, listener and request gets a unique ID when it
//! is created. IDs are plain counters: cheap to copy, hash and compare, and
//! stable for the lifetime of the thing they name.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counter_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            /// Generate a new unique ID.
            ///
            /// Uses an atomic counter so IDs stay unique across threads.
            pub fn new() -> Self {
                static COUNTER: AtomicU64 = AtomicU64::new(0);
                Self(COUNTER.fetch_add(1, Ordering::Relaxed))
            }

            /// Get the raw ID value.
            pub fn raw(&self) -> u64 {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

counter_id!(
    /// Identifies a query descriptor. Shared by every snapshot of that query.
    QueryId,
    "query"
);

counter_id!(
    /// Identifies an effect descriptor. Shared by every snapshot of that effect.
    EffectId,
    "effect"
);

counter_id!(
    /// Identifies a store instance.
    StoreId,
    "store"
);

counter_id!(
    /// Identifies a registered listener (store subscription or event handler).
    ListenerId,
    "listener"
);

counter_id!(
    /// Identifies one trigger attempt of a query or effect.
    RequestId,
    "request"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let id1 = QueryId::new();
        let id2 = QueryId::new();
        let id3 = QueryId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn ids_are_ordered_by_creation() {
        let first = RequestId::new();
        let second = RequestId::new();
        assert!(first < second);
        assert!(first.raw() < second.raw());
    }

    #[test]
    fn display_includes_kind() {
        let id = StoreId::new();
        assert_eq!(id.to_string(), format!("store#{}", id.raw()));
    }
}
