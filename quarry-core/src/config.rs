//! Runtime configuration.
//!
//! Defaults here apply to every query bound through a [`Runtime`] unless the
//! query sets its own value.
//!
//! [`Runtime`]: crate::Runtime

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default debounce window for queries.
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;

/// Default maximum number of attempts for queries.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;

/// Top-level configuration for a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Defaults applied to queries.
    pub query: QueryDefaults,
    /// Defaults applied to effects.
    pub effect: EffectDefaults,
}

impl RuntimeConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Query defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryDefaults {
    /// Minimum time between the start of one fetch and the start of a new one.
    pub debounce_ms: u64,
    /// Whether dependency changes mark queries stale instead of refetching.
    pub lazy: bool,
    /// How long a fresh value stays fresh. `None` keeps it fresh forever.
    pub stale_time_ms: Option<u64>,
    /// Maximum number of attempts.
    pub retry: u32,
}

impl QueryDefaults {
    pub(crate) fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub(crate) fn stale_time(&self) -> Option<Duration> {
        self.stale_time_ms.map(Duration::from_millis)
    }
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            lazy: true,
            stale_time_ms: None,
            retry: DEFAULT_RETRY_ATTEMPTS,
        }
    }
}

/// Effect defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectDefaults {
    /// How many requests and errors an effect keeps, newest last. `None`
    /// keeps the whole history.
    pub history: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.query.debounce(), Duration::from_millis(300));
        assert!(config.query.lazy);
        assert_eq!(config.query.stale_time(), None);
        assert_eq!(config.query.retry, 5);
        assert_eq!(config.effect.history, None);
    }

    #[test]
    fn effect_history_cap() {
        let config = RuntimeConfig::from_json(r#"{"effect": {"history": 20}}"#).unwrap();
        assert_eq!(config.effect.history, Some(20));
        assert_eq!(config.query, QueryDefaults::default());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = RuntimeConfig::from_json(r#"{"query": {"lazy": false, "stale_time_ms": 60000}}"#)
            .unwrap();
        assert!(!config.query.lazy);
        assert_eq!(config.query.stale_time(), Some(Duration::from_secs(60)));
        assert_eq!(config.query.debounce_ms, DEFAULT_DEBOUNCE_MS);
        assert_eq!(config.query.retry, DEFAULT_RETRY_ATTEMPTS);
    }

    #[test]
    fn empty_json_is_default() {
        assert_eq!(RuntimeConfig::from_json("{}").unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(RuntimeConfig::from_json(r#"{"query": {"retry": "many"}}"#).is_err());
    }
}
