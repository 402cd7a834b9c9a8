//! In-memory implementation of the store traits.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use driftsync_core::{DeviceId, Digest, FetchTask, Name, StateSnapshot, TaskKey};

use crate::error::{Result, StoreError};
use crate::traits::{DigestLog, TaskStore};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Current device sequences (zero entries allowed).
    seqs: BTreeMap<DeviceId, u64>,

    /// Routing hints.
    locators: HashMap<DeviceId, Name>,

    /// Recorded digests and their snapshots.
    digests: HashMap<Digest, StateSnapshot>,

    /// Fetch tasks with an insertion counter for ordering.
    tasks: HashMap<TaskKey, (u64, FetchTask)>,
    next_task_order: u64,
}

impl MemoryStoreInner {
    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::from_entries(self.seqs.iter().map(|(d, s)| (d.clone(), *s)))
    }
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DigestLog for MemoryStore {
    async fn update_device_seq(&self, device: &DeviceId, seq: u64) -> Result<u64> {
        let mut inner = self.write()?;
        let stored = inner.seqs.entry(device.clone()).or_insert(0);
        *stored = (*stored).max(seq);
        Ok(*stored)
    }

    async fn device_seq(&self, device: &DeviceId) -> Result<Option<u64>> {
        Ok(self.read()?.seqs.get(device).copied())
    }

    async fn update_locator(&self, device: &DeviceId, locator: &Name) -> Result<()> {
        let mut inner = self.write()?;
        inner.seqs.entry(device.clone()).or_insert(0);
        inner.locators.insert(device.clone(), locator.clone());
        Ok(())
    }

    async fn locator(&self, device: &DeviceId) -> Result<Option<Name>> {
        Ok(self.read()?.locators.get(device).cloned())
    }

    async fn current_state(&self) -> Result<StateSnapshot> {
        Ok(self.read()?.snapshot())
    }

    async fn remember_state(&self) -> Result<Digest> {
        let mut inner = self.write()?;
        let snapshot = inner.snapshot();
        let digest = snapshot.digest();
        inner.digests.insert(digest, snapshot);
        Ok(digest)
    }

    async fn is_known_digest(&self, digest: &Digest) -> Result<bool> {
        Ok(digest.is_origin() || self.read()?.digests.contains_key(digest))
    }

    async fn snapshot(&self, digest: &Digest) -> Result<Option<StateSnapshot>> {
        let inner = self.read()?;
        match inner.digests.get(digest) {
            Some(snapshot) => Ok(Some(snapshot.clone())),
            None if digest.is_origin() => Ok(Some(StateSnapshot::new())),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn save_task(&self, task: &FetchTask) -> Result<bool> {
        let mut inner = self.write()?;
        let key = task.key();
        if inner.tasks.contains_key(&key) {
            return Ok(false);
        }
        let order = inner.next_task_order;
        inner.next_task_order += 1;
        inner.tasks.insert(key, (order, task.clone()));
        Ok(true)
    }

    async fn merge_task(&self, task: &FetchTask) -> Result<FetchTask> {
        let mut inner = self.write()?;
        if let Some((_, stored)) = inner.tasks.get_mut(&task.key()) {
            stored.widen(task);
            return Ok(stored.clone());
        }
        let order = inner.next_task_order;
        inner.next_task_order += 1;
        inner.tasks.insert(task.key(), (order, task.clone()));
        Ok(task.clone())
    }

    async fn delete_task(&self, key: &TaskKey) -> Result<bool> {
        Ok(self.write()?.tasks.remove(key).is_some())
    }

    async fn has_task(&self, key: &TaskKey) -> Result<bool> {
        Ok(self.read()?.tasks.contains_key(key))
    }

    async fn list_tasks(&self) -> Result<Vec<FetchTask>> {
        let inner = self.read()?;
        let mut tasks: Vec<_> = inner.tasks.values().cloned().collect();
        tasks.sort_by_key(|(order, _)| *order);
        Ok(tasks.into_iter().map(|(_, task)| task).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_core::{DeltaKind, Priority};
    use proptest::prelude::*;

    fn device(name: &str) -> DeviceId {
        name.parse().unwrap()
    }

    #[tokio::test]
    async fn test_memory_matches_scenario_one() {
        let a = MemoryStore::new();
        let b = MemoryStore::new();
        let origin_a = a.remember_state().await.unwrap();
        let origin_b = b.remember_state().await.unwrap();
        assert_eq!(origin_a, origin_b);
        assert_eq!(origin_a, Digest::origin());

        a.update_device_seq(&device("/a"), 1).await.unwrap();
        let after = a.remember_state().await.unwrap();

        let records = a.find_differences(&origin_a, &after, false).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, DeltaKind::Update);
        assert_eq!(records[0].device, device("/a"));
        assert_eq!(records[0].seq, 1);
    }

    #[tokio::test]
    async fn test_find_differences_carries_locator() {
        let store = MemoryStore::new();
        let locator: Name = "/isp/a".parse().unwrap();
        store.update_locator(&device("/a"), &locator).await.unwrap();
        store.update_device_seq(&device("/a"), 2).await.unwrap();
        let digest = store.remember_state().await.unwrap();

        let records = store
            .find_differences(&Digest::origin(), &digest, true)
            .await
            .unwrap();
        assert_eq!(records[0].locator, Some(locator));
        assert_eq!(records[0].missing_range(), Some((1, 2)));
    }

    #[tokio::test]
    async fn test_task_order_is_insertion_order() {
        let store = MemoryStore::new();
        for i in 0..5u8 {
            let task = FetchTask::new(
                device(&format!("/d{}", i)),
                "/obj".parse().unwrap(),
                0,
                1,
                Priority::Normal,
            );
            store.save_task(&task).await.unwrap();
        }
        let names: Vec<String> = store
            .list_tasks()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.producer.to_string())
            .collect();
        assert_eq!(names, vec!["/d0", "/d1", "/d2", "/d3", "/d4"]);
    }

    #[tokio::test]
    async fn test_merge_task_widens_stored_range() {
        let store = MemoryStore::new();
        let first = FetchTask::new(
            device("/a"),
            "/a/actions".parse().unwrap(),
            1,
            3,
            Priority::Normal,
        );
        let mut second = first.clone();
        second.min_seq = 4;
        second.max_seq = 6;

        assert_eq!(store.merge_task(&first).await.unwrap(), first);
        let stored = store.merge_task(&second).await.unwrap();
        assert_eq!((stored.min_seq, stored.max_seq), (1, 6));
        assert_eq!(store.list_tasks().await.unwrap(), vec![stored]);
    }

    proptest! {
        #[test]
        fn prop_remember_state_is_order_independent(
            updates in prop::collection::vec((0u8..5, 0u64..20), 0..30)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let forward = MemoryStore::new();
                let backward = MemoryStore::new();
                for (d, s) in &updates {
                    forward.update_device_seq(&device(&format!("/d{}", d)), *s).await.unwrap();
                }
                for (d, s) in updates.iter().rev() {
                    backward.update_device_seq(&device(&format!("/d{}", d)), *s).await.unwrap();
                }
                // Applying everything twice must not move the digest.
                for (d, s) in &updates {
                    backward.update_device_seq(&device(&format!("/d{}", d)), *s).await.unwrap();
                }
                assert_eq!(
                    forward.remember_state().await.unwrap(),
                    backward.remember_state().await.unwrap()
                );
            });
        }
    }
}
