//! Error types for the cache layer.

use thiserror::Error;

/// Errors reported by a [`CacheStore`](super::CacheStore).
///
/// [`CacheMiss`](Self::CacheMiss) and [`NotStored`](Self::NotStored) are
/// expected outcomes of the store contract; the remaining variants mean
/// caching is degraded, never that a request must fail.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key is absent or its entry has expired.
    #[error("cache miss")]
    CacheMiss,

    /// A conditional write (`add`/`replace`) found its precondition unmet.
    #[error("item not stored")]
    NotStored,

    /// The backend could not be reached or failed mid-operation.
    #[error("cache backend unavailable: {0}")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A persisted payload could not be encoded or decoded.
    #[error("cache codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A persisted payload decoded but is unusable for the operation.
    #[error("invalid cached payload for `{key}`: {reason}")]
    InvalidPayload { key: String, reason: String },
}

impl StoreError {
    /// Wraps a backend failure.
    pub fn unavailable(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Unavailable(err.into())
    }

    /// Returns `true` for a clean miss.
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::CacheMiss)
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Why a caller of [`Coalescer::execute`](super::Coalescer::execute) got no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CoalesceError {
    /// The waiter's own cancellation fired first.
    #[error("cancelled while waiting for an in-flight computation")]
    Cancelled,

    /// The computation being waited on was dropped before it published.
    #[error("in-flight computation was abandoned before completing")]
    Abandoned,
}

/// Errors raised while assembling cache configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("a strategy resolver is required")]
    MissingResolver,

    #[error("invalid cache configuration: {0}")]
    Parse(#[from] serde_json::Error),
}
