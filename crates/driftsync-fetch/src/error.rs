//! Error types for the fetch pipeline.

use thiserror::Error;

/// Errors that can occur while managing fetch tasks.
///
/// Transport timeouts are not errors; they drive retry and backoff.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Persisting or loading a task failed.
    #[error("store error: {0}")]
    Store(#[from] driftsync_store::StoreError),

    /// The manager has been shut down.
    #[error("fetch manager stopped")]
    Stopped,
}

/// Result type for fetch operations.
pub type Result<T> = std::result::Result<T, FetchError>;
