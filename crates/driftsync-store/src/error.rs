//! Error types for the store module.

use driftsync_core::{CoreError, Digest};
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The digest was never recorded in this log.
    #[error("unknown digest: {0}")]
    UnknownDigest(Digest),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Stored value failed to decode.
    #[error("decode error: {0}")]
    Decode(#[from] CoreError),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// The connection mutex was poisoned by a panicking holder.
    #[error("connection lock poisoned: {0}")]
    LockPoisoned(String),

    /// A blocking storage task failed to complete.
    #[error("blocking task failed: {0}")]
    TaskJoin(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
