//! Store traits: the abstract interfaces for digest-log and task persistence.
//!
//! These traits keep the sync and fetch layers storage-agnostic. Implementations
//! include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;
use driftsync_core::{DeltaRecord, DeviceId, Digest, FetchTask, Name, StateSnapshot, TaskKey};

use crate::error::{Result, StoreError};

/// The state digest log.
///
/// Holds the current device sequence table and a permanent record of every
/// digest computed from it. A digest is a content address for one exact
/// global state; recording the same digest again replaces its snapshot rows.
///
/// # Design Notes
///
/// - **Monotonic**: sequences only move forward through `update_device_seq`.
/// - **Locators are hints**: they are stored with the device but never hashed.
/// - **Origin**: [`Digest::origin`] is always known and maps to the empty
///   snapshot, even before anything has been recorded.
#[async_trait]
pub trait DigestLog: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Device Sequence State
    // ─────────────────────────────────────────────────────────────────────────

    /// Merge `seq` into the stored value with `max(existing, seq)`.
    ///
    /// Returns the stored sequence after the merge.
    async fn update_device_seq(&self, device: &DeviceId, seq: u64) -> Result<u64>;

    /// Stored sequence for `device`, if the device is known.
    async fn device_seq(&self, device: &DeviceId) -> Result<Option<u64>>;

    /// Record the last known routing hint for `device`.
    async fn update_locator(&self, device: &DeviceId, locator: &Name) -> Result<()>;

    /// Last known routing hint for `device`.
    async fn locator(&self, device: &DeviceId) -> Result<Option<Name>>;

    /// The current device sequence state.
    async fn current_state(&self) -> Result<StateSnapshot>;

    // ─────────────────────────────────────────────────────────────────────────
    // Digest Log
    // ─────────────────────────────────────────────────────────────────────────

    /// Snapshot the current state, record its digest with the snapshot rows,
    /// and return the digest.
    async fn remember_state(&self) -> Result<Digest>;

    /// Whether `digest` has been recorded (the origin always has).
    async fn is_known_digest(&self, digest: &Digest) -> Result<bool>;

    /// The snapshot recorded under `digest`.
    async fn snapshot(&self, digest: &Digest) -> Result<Option<StateSnapshot>>;

    /// Per-device differences between two recorded digests.
    ///
    /// Returns [`StoreError::UnknownDigest`] if either digest was never
    /// recorded. Each record carries the device's current locator if known.
    async fn find_differences(
        &self,
        old: &Digest,
        new: &Digest,
        include_old_seq: bool,
    ) -> Result<Vec<DeltaRecord>> {
        let old_snapshot = self
            .snapshot(old)
            .await?
            .ok_or(StoreError::UnknownDigest(*old))?;
        let new_snapshot = self
            .snapshot(new)
            .await?
            .ok_or(StoreError::UnknownDigest(*new))?;

        let mut records = old_snapshot.diff(&new_snapshot, include_old_seq);
        for record in &mut records {
            record.locator = self.locator(&record.device).await?;
        }
        Ok(records)
    }
}

/// Persistent storage for outstanding fetch tasks.
///
/// Tasks are keyed by (producer, base name). The stored value is the
/// sequence range and priority; forwarding hints are resolved afresh on load.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert `task` unless a task with the same key exists.
    ///
    /// Returns true if the task was inserted.
    async fn save_task(&self, task: &FetchTask) -> Result<bool>;

    /// Insert `task`, or widen the stored task with the same key so its
    /// range also spans `task`'s.
    ///
    /// Returns the task as stored.
    async fn merge_task(&self, task: &FetchTask) -> Result<FetchTask>;

    /// Delete the task with `key`. Returns true if one was removed.
    async fn delete_task(&self, key: &TaskKey) -> Result<bool>;

    /// Whether a task with `key` is stored.
    async fn has_task(&self, key: &TaskKey) -> Result<bool>;

    /// All stored tasks, in insertion order.
    async fn list_tasks(&self) -> Result<Vec<FetchTask>>;
}
