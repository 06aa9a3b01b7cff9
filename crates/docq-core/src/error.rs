use thiserror::Error;

use crate::domain::Topic;

/// Errors returned to producers and to the owning application.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("NOT_INITED: queue must be initialized before use")]
    NotInitialized,

    #[error("duplicate ordering key: {0}")]
    DuplicateKey(String),

    #[error("queue has already started consuming")]
    AlreadyStarted,

    #[error("{0} queue binds a single consumer; topic routing is not supported")]
    TopicRoutingUnsupported(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateKey { key } => QueueError::DuplicateKey(key),
            other => QueueError::Store(other),
        }
    }
}

/// Errors surfaced by an [`ItemStore`](crate::ports::ItemStore) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A unique index rejected the write.
    #[error("unique index violation on ordering key {key}")]
    DuplicateKey { key: String },

    /// The backend could not be reached (transient).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store error: {0}")]
    Backend(String),
}

/// Failure of a single consume attempt.
///
/// These never escape the worker channel; they are written into the item's
/// failure log and drive the retry state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsumeError {
    #[error("INIT_MISSING: consumer for {0} is not ready")]
    ConsumerNotReady(Topic),

    #[error("WRONG_ORDER: item consumed at wrong order")]
    WrongOrder,

    #[error("{0}")]
    Failed(String),
}

impl ConsumeError {
    pub fn failed(message: impl Into<String>) -> Self {
        ConsumeError::Failed(message.into())
    }

    /// Whether this failure counts against the item's `fail_count`.
    pub fn is_counted(&self) -> bool {
        !matches!(self, ConsumeError::WrongOrder)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    Invalid { var: String, value: String },
}
