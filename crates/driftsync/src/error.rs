//! Error types for the node.

use thiserror::Error;

use driftsync_fetch::FetchError;
use driftsync_store::StoreError;
use driftsync_sync::SyncError;

/// Node errors.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("node has been shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, NodeError>;
