//! Error types for the sync module.

use thiserror::Error;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Message could not be decoded.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Message could not be encoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Name is not a sync or recovery name under our prefix.
    #[error("unexpected name: {0}")]
    UnexpectedName(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Store operation failed.
    #[error("store error: {0}")]
    StoreError(#[from] driftsync_store::StoreError),

    /// The sync event loop has stopped.
    #[error("sync core stopped")]
    Stopped,
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
