//! Error types for cache synchronization.
//!
//! This module provides [`MeshError`], the error type shared by the store
//! contract, the cache skeleton, and the process runtime.

/// Error type for cache synchronization operations.
///
/// This error type is designed to:
/// - Cover all failure modes without using panics
/// - Distinguish transient store failures from fatal configuration errors
/// - Support error chaining via the `source` field
///
/// Drift between the store and a cache is not an error; it is reported
/// through the update outcome instead.
///
/// # Example
///
/// ```rust
/// use mesh_core::MeshError;
///
/// fn validate_window(millis: u64) -> Result<(), MeshError> {
///     if millis == 0 {
///         return Err(MeshError::Configuration(
///             "rollback window must be positive".to_string(),
///         ));
///     }
///     Ok(())
/// }
///
/// assert!(validate_window(0).is_err());
/// ```
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// The backing store could not serve a query. Transient; retried next tick.
    #[error("store unavailable during {operation}: {message}")]
    StoreUnavailable {
        /// The store operation that failed.
        operation: String,
        /// Description of the failure.
        message: String,
        /// Optional underlying error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration error. Fatal to cache initialization.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A listener callback failed while handling an event.
    #[error("listener {listener} failed: {message}")]
    ListenerFailed {
        /// Name of the listener.
        listener: String,
        /// Error message reported by the listener.
        message: String,
    },

    /// The notification queue has no consumer left.
    #[error("queue closed: {queue}")]
    QueueClosed {
        /// Name of the queue.
        queue: String,
    },

    /// A deduplicated caller observed the failure of the in-flight leader.
    #[error("in-flight update {key} failed: {message}")]
    InFlightFailed {
        /// Dedup key, usually the cache name.
        key: String,
        /// Error message of the leader's failure.
        message: String,
    },

    /// Operation timed out.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
    },

    /// The cache manager is shutting down.
    #[error("cache manager is shutting down")]
    Shutdown,

    /// Unexpected internal error.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
        /// Optional underlying error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl MeshError {
    /// Create a store error wrapping an underlying error.
    pub fn store<E>(operation: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::StoreUnavailable {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a store error from a message only.
    pub fn store_message(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create an internal error from any error type.
    pub fn internal<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether the next scheduled tick may succeed without intervention.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. } | Self::InFlightFailed { .. } | Self::Timeout { .. }
        )
    }
}
