//! Error types.
//!
//! Two kinds of failure flow through the engine:
//!
//! - [`FetchError`]: an operation (query fetch or effect run) failed. These are
//!   runtime conditions. They are captured into the store slot and handed to
//!   every waiter of the shared attempt, so the type is cheap to clone.
//!
//! - [`Error`]: everything else. Contract violations (a key that does not hold
//!   a query, a server value without a timestamp, persistence misuse) fail
//!   fast with one of these; they are programmer errors, not states to
//!   recover from.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure of a query fetch or an effect run.
#[derive(Clone)]
pub struct FetchError {
    message: Arc<str>,
    source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl FetchError {
    /// Create an error from a message.
    pub fn msg(message: impl fmt::Display) -> Self {
        Self {
            message: message.to_string().into(),
            source: None,
        }
    }

    /// Wrap an underlying error. Its message becomes this error's message.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: error.to_string().into(),
            source: Some(Arc::new(error)),
        }
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchError")
            .field("message", &self.message)
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

impl StdError for FetchError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

impl PartialEq for FetchError {
    fn eq(&self, other: &Self) -> bool {
        self.message == other.message
    }
}

/// Engine error.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying operation failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// A descriptor was used before its store was subscribed.
    #[error("{0} is not bound to a store yet")]
    Unbound(String),

    /// The store owning a slot has been dropped.
    #[error("store owning slot `{0}` has been dropped")]
    StoreDropped(String),

    /// The selected slot does not exist.
    #[error("slot `{0}` does not exist")]
    MissingSlot(String),

    /// The selected slot holds plain data.
    #[error("slot `{0}` must hold a query or an effect")]
    NotQueryOrEffect(String),

    /// A query was expected.
    #[error("slot `{0}` does not hold a query")]
    NotQuery(String),

    /// An effect was expected.
    #[error("slot `{0}` does not hold an effect")]
    NotEffect(String),

    /// A server value was supplied without its timestamp.
    #[error("a timestamp must be provided together with a value")]
    ValueWithoutTimestamp,

    /// A timestamp was supplied without a server value.
    #[error("a value must be provided together with a timestamp")]
    TimestampWithoutValue,

    /// A constructor received malformed arguments.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Persistence options lack a required function.
    #[error("persist options must have a {0} function")]
    MissingPersistFn(&'static str),

    /// Rehydration was requested manually after it already completed.
    #[error("store has already been hydrated; do not call rehydrate manually")]
    AlreadyHydrated,

    /// JSON conversion failed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding failed.
    #[error("msgpack encode: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding failed.
    #[error("msgpack decode: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),
}

impl Error {
    /// The fetch failure, if this error wraps one.
    pub fn as_fetch(&self) -> Option<&FetchError> {
        match self {
            Error::Fetch(e) => Some(e),
            _ => None,
        }
    }
}
