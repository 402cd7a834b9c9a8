//! Bounded-concurrency scheduling of fetch tasks.
//!
//! The manager owns an ordered worklist of fetchers. High priority tasks go
//! to the front, normal ones to the back. A single scheduler task walks the
//! list from the front and starts pipelines while fewer than
//! `max_parallel_fetches` are active. Finished fetchers linger in a timed
//! wait so duplicate requests for a range that just completed are absorbed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use driftsync_core::{DeviceId, FetchTask, Name, Priority, TaskKey};
use driftsync_store::TaskStore;
use driftsync_sync::Transport;

use crate::error::{FetchError, Result};
use crate::fetcher::{Attempt, Fetcher};
use crate::handler::{FetchHandler, ForwardingHint, NameResolver};

/// Configuration for the fetch pipeline.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Pipelines allowed to run at once.
    pub max_parallel_fetches: usize,
    /// Outstanding segment interests per pipeline.
    pub pipeline_width: usize,
    /// Lifetime of each segment interest.
    pub segment_timeout: Duration,
    /// Cap on the pause between failed attempts.
    pub max_retry_pause: Duration,
    /// How long a finished fetcher stays in the worklist.
    pub timed_wait: Duration,
    /// Longest the scheduler sleeps without being woken.
    pub max_idle_interval: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_parallel_fetches: 3,
            pipeline_width: 6,
            segment_timeout: Duration::from_secs(30),
            max_retry_pause: Duration::from_secs(300),
            timed_wait: Duration::from_secs(10),
            max_idle_interval: Duration::from_secs(300),
        }
    }
}

impl FetchConfig {
    pub fn with_max_parallel_fetches(mut self, max: usize) -> Self {
        self.max_parallel_fetches = max;
        self
    }

    pub fn with_pipeline_width(mut self, width: usize) -> Self {
        self.pipeline_width = width;
        self
    }

    pub fn with_segment_timeout(mut self, timeout: Duration) -> Self {
        self.segment_timeout = timeout;
        self
    }

    pub fn with_max_retry_pause(mut self, pause: Duration) -> Self {
        self.max_retry_pause = pause;
        self
    }

    pub fn with_timed_wait(mut self, wait: Duration) -> Self {
        self.timed_wait = wait;
        self
    }
}

/// Position of a fetcher in the manager's arena.
pub type FetcherId = u64;

/// Externally visible state of a worklist entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetcherState {
    /// Waiting for a free slot or for its retry time.
    Waiting {
        next_retry: Instant,
        retry_pause: Duration,
        hint: ForwardingHint,
    },
    /// A pipeline is running.
    Active,
    /// Finished, absorbing duplicates until `until`.
    TimedWait { until: Instant },
}

enum SlotState {
    Idle(Box<Fetcher>),
    Active(Option<JoinHandle<()>>),
    TimedWait { until: Instant },
}

struct Slot {
    task: FetchTask,
    state: SlotState,
}

#[derive(Default)]
struct Worklist {
    order: VecDeque<FetcherId>,
    slots: HashMap<FetcherId, Slot>,
    active: usize,
    next_id: FetcherId,
    stopped: bool,
}

impl Worklist {
    /// Whether an existing entry already covers `task`'s range.
    fn covers(&self, task: &FetchTask) -> bool {
        self.slots.values().any(|slot| {
            slot.task.producer == task.producer
                && slot.task.base_name == task.base_name
                && slot.task.min_seq <= task.min_seq
                && slot.task.max_seq >= task.max_seq
        })
    }

    fn purge_timed_wait(&mut self, now: Instant) {
        let expired: Vec<FetcherId> = self
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot.state, SlotState::TimedWait { until } if until <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.slots.remove(id);
        }
        if !expired.is_empty() {
            self.order.retain(|id| !expired.contains(id));
            trace!(purged = expired.len(), "purged finished fetchers");
        }
    }

    /// The span of every unfinished entry for `key`, if there is one.
    fn live_span_for(&self, key: &TaskKey) -> Option<FetchTask> {
        self.order
            .iter()
            .filter_map(|id| self.slots.get(id))
            .filter(|slot| {
                !matches!(slot.state, SlotState::TimedWait { .. }) && &slot.task.key() == key
            })
            .fold(None, |span: Option<FetchTask>, slot| match span {
                Some(mut span) => {
                    span.widen(&slot.task);
                    Some(span)
                }
                None => Some(slot.task.clone()),
            })
    }

    fn release(&mut self) {
        self.active = self.active.saturating_sub(1);
    }
}

enum Step {
    Wait(Instant),
    Start,
    Skip,
}

struct Inner {
    transport: Arc<dyn Transport>,
    store: Arc<dyn TaskStore>,
    resolver: Arc<dyn NameResolver>,
    config: FetchConfig,
    worklist: Mutex<Worklist>,
    wake: Notify,
    /// Held across every task store write so the persisted row for a key
    /// always spans the live worklist entries for it.
    persist: tokio::sync::Mutex<()>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Worklist> {
        self.worklist.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One scheduling pass. Returns the next wake time, or `None` once stopped.
    fn schedule(self: &Arc<Self>) -> Option<Instant> {
        let now = Instant::now();
        let mut list = self.lock();
        if list.stopped {
            return None;
        }

        list.purge_timed_wait(now);
        let mut next_wake = now + self.config.max_idle_interval;

        let ids: Vec<FetcherId> = list.order.iter().copied().collect();
        for id in ids {
            let step = match list.slots.get(&id).map(|slot| &slot.state) {
                Some(SlotState::TimedWait { until }) => Step::Wait(*until),
                Some(SlotState::Idle(fetcher)) if fetcher.next_retry() > now => {
                    Step::Wait(fetcher.next_retry())
                }
                Some(SlotState::Idle(_)) => Step::Start,
                _ => Step::Skip,
            };

            match step {
                Step::Wait(at) => next_wake = next_wake.min(at),
                Step::Start if list.active < self.config.max_parallel_fetches => {
                    self.activate(&mut list, id);
                }
                Step::Start | Step::Skip => {}
            }
        }

        Some(next_wake)
    }

    fn activate(self: &Arc<Self>, list: &mut Worklist, id: FetcherId) {
        let fetcher = match list.slots.get_mut(&id) {
            Some(slot) => match std::mem::replace(&mut slot.state, SlotState::Active(None)) {
                SlotState::Idle(fetcher) => fetcher,
                other => {
                    slot.state = other;
                    return;
                }
            },
            None => return,
        };

        let handle = tokio::spawn(run_pipeline(Arc::clone(self), id, fetcher));
        if let Some(slot) = list.slots.get_mut(&id) {
            slot.state = SlotState::Active(Some(handle));
        }
        list.active += 1;
    }

    async fn complete(&self, id: FetcherId, fetcher: Box<Fetcher>) {
        let task = fetcher.task().clone();
        let key = task.key();
        let _persist = self.persist.lock().await;

        let remaining = {
            let mut list = self.lock();
            match list.slots.get_mut(&id) {
                Some(slot) if matches!(slot.state, SlotState::Active(_)) => {
                    slot.state = SlotState::TimedWait {
                        until: Instant::now() + self.config.timed_wait,
                    };
                }
                // Cancelled while running.
                _ => return,
            }
            list.release();
            list.live_span_for(&key)
        };

        // The persisted row shrinks to what the other entries still need.
        if let Err(e) = self.store.delete_task(&key).await {
            error!(producer = %task.producer, error = %e, "failed to delete finished task");
        }
        if let Some(span) = remaining {
            if let Err(e) = self.store.merge_task(&span).await {
                error!(producer = %span.producer, error = %e, "failed to persist pending task");
            }
        }

        info!(
            producer = %task.producer,
            base = %task.base_name,
            min = task.min_seq,
            max = task.max_seq,
            "fetch complete"
        );
    }

    fn fail(&self, id: FetcherId, mut fetcher: Box<Fetcher>) {
        let pause = fetcher.fail_attempt(self.resolver.as_ref());
        debug!(
            producer = %fetcher.task().producer,
            pause_ms = pause.as_millis() as u64,
            hint = ?fetcher.hint(),
            "fetch attempt failed, backing off"
        );

        let mut list = self.lock();
        match list.slots.get_mut(&id) {
            Some(slot) if matches!(slot.state, SlotState::Active(_)) => {
                slot.state = SlotState::Idle(fetcher);
            }
            _ => return,
        }
        list.release();
    }

    fn stop(&self) {
        let mut list = self.lock();
        list.stopped = true;
        for slot in list.slots.values_mut() {
            if let SlotState::Active(Some(handle)) = &slot.state {
                handle.abort();
            }
        }
        list.active = 0;
    }
}

async fn run_pipeline(inner: Arc<Inner>, id: FetcherId, mut fetcher: Box<Fetcher>) {
    match fetcher.run_attempt(&inner.transport, &inner.config).await {
        Attempt::Completed => inner.complete(id, fetcher).await,
        Attempt::Failed => inner.fail(id, fetcher),
    }
    inner.wake.notify_one();
}

async fn run_scheduler(inner: Arc<Inner>) {
    debug!("fetch scheduler started");
    while let Some(next_wake) = inner.schedule() {
        tokio::select! {
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep_until(next_wake) => {}
        }
    }
    debug!("fetch scheduler stopped");
}

/// Schedules fetch tasks over a shared transport.
pub struct FetchManager {
    inner: Arc<Inner>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl FetchManager {
    /// Create a manager. Nothing runs until [`FetchManager::start`].
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn TaskStore>,
        resolver: Arc<dyn NameResolver>,
        config: FetchConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                store,
                resolver,
                config,
                worklist: Mutex::new(Worklist::default()),
                wake: Notify::new(),
                persist: tokio::sync::Mutex::new(()),
            }),
            scheduler: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.inner.config
    }

    /// Start the scheduler task. Calling this twice is a no-op.
    pub fn start(&self) {
        let mut scheduler = self.scheduler.lock().unwrap_or_else(PoisonError::into_inner);
        if scheduler.is_none() {
            *scheduler = Some(tokio::spawn(run_scheduler(Arc::clone(&self.inner))));
        }
    }

    /// Add a task to the worklist.
    ///
    /// Returns false without doing anything if the range is empty or an
    /// existing entry for the same producer and base already covers it.
    /// The persisted task for the key is widened to span the new range.
    pub async fn enqueue(&self, task: FetchTask, handler: Arc<dyn FetchHandler>) -> Result<bool> {
        if task.is_empty() {
            trace!(producer = %task.producer, "ignoring empty fetch range");
            return Ok(false);
        }
        let _persist = self.inner.persist.lock().await;
        if !self.admissible(&task)? {
            return Ok(false);
        }

        let hint = ForwardingHint::Direct(self.inner.resolver.resolve(&task.producer));
        let stored = self.inner.store.merge_task(&task).await?;
        if stored != task {
            trace!(
                producer = %task.producer,
                min = stored.min_seq,
                max = stored.max_seq,
                "widened persisted task"
            );
        }

        info!(
            producer = %task.producer,
            base = %task.base_name,
            min = task.min_seq,
            max = task.max_seq,
            priority = ?task.priority,
            "enqueued fetch"
        );

        let fetcher = Fetcher::new(
            task.clone(),
            handler,
            hint,
            self.inner.config.max_retry_pause,
        );
        {
            let mut list = self.inner.lock();
            if list.stopped {
                return Err(FetchError::Stopped);
            }
            let id = list.next_id;
            list.next_id += 1;
            let priority = task.priority;
            list.slots.insert(
                id,
                Slot {
                    task,
                    state: SlotState::Idle(Box::new(fetcher)),
                },
            );
            match priority {
                Priority::High => list.order.push_front(id),
                Priority::Normal => list.order.push_back(id),
            }
        }

        self.inner.wake.notify_one();
        Ok(true)
    }

    /// Whether `task` may join the worklist. Errors once stopped.
    fn admissible(&self, task: &FetchTask) -> Result<bool> {
        let list = self.inner.lock();
        if list.stopped {
            return Err(FetchError::Stopped);
        }
        if list.covers(task) {
            debug!(
                producer = %task.producer,
                min = task.min_seq,
                max = task.max_seq,
                "range already scheduled"
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Drop every entry for `producer`/`base` and its persisted task.
    ///
    /// Running pipelines are aborted. Returns true if anything was removed.
    pub async fn cancel(&self, producer: &DeviceId, base: &Name) -> Result<bool> {
        let key = TaskKey {
            producer: producer.clone(),
            base_name: base.clone(),
        };

        let _persist = self.inner.persist.lock().await;
        let removed = {
            let mut list = self.inner.lock();
            let ids: Vec<FetcherId> = list
                .slots
                .iter()
                .filter(|(_, slot)| slot.task.key() == key)
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                if let Some(Slot {
                    state: SlotState::Active(handle),
                    ..
                }) = list.slots.remove(id)
                {
                    if let Some(handle) = handle {
                        handle.abort();
                    }
                    list.release();
                }
            }
            list.order.retain(|id| !ids.contains(id));
            !ids.is_empty()
        };

        let persisted = self.inner.store.delete_task(&key).await?;
        if removed || persisted {
            info!(producer = %producer, base = %base, "cancelled fetch");
        }
        self.inner.wake.notify_one();
        Ok(removed || persisted)
    }

    /// Re-enqueue every persisted task.
    ///
    /// Returns the number of tasks added to the worklist.
    pub async fn restore(&self, handler: Arc<dyn FetchHandler>) -> Result<usize> {
        let tasks = self.inner.store.list_tasks().await?;
        let mut restored = 0;
        for task in tasks {
            if self.enqueue(task, Arc::clone(&handler)).await? {
                restored += 1;
            }
        }
        info!(restored, "restored fetch tasks");
        Ok(restored)
    }

    /// Worklist entries in scheduling order.
    pub fn fetchers(&self) -> Vec<(FetchTask, FetcherState)> {
        let list = self.inner.lock();
        list.order
            .iter()
            .filter_map(|id| list.slots.get(id))
            .map(|slot| {
                let state = match &slot.state {
                    SlotState::Idle(fetcher) => FetcherState::Waiting {
                        next_retry: fetcher.next_retry(),
                        retry_pause: fetcher.retry_pause(),
                        hint: fetcher.hint().clone(),
                    },
                    SlotState::Active(_) => FetcherState::Active,
                    SlotState::TimedWait { until } => FetcherState::TimedWait { until: *until },
                };
                (slot.task.clone(), state)
            })
            .collect()
    }

    /// Number of worklist entries, including finished ones in timed wait.
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of running pipelines.
    pub fn active_count(&self) -> usize {
        self.inner.lock().active
    }

    /// Stop scheduling and abort running pipelines.
    ///
    /// Persisted tasks are kept for [`FetchManager::restore`].
    pub fn shutdown(&self) {
        self.inner.stop();
        if let Some(scheduler) = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            scheduler.abort();
        }
    }
}

impl Drop for FetchManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(producer: &str, min: u64, max: u64) -> FetchTask {
        FetchTask::new(
            producer.parse().unwrap(),
            "/actions".parse().unwrap(),
            min,
            max,
            Priority::Normal,
        )
    }

    #[test]
    fn test_default_config() {
        let config = FetchConfig::default();
        assert_eq!(config.max_parallel_fetches, 3);
        assert_eq!(config.pipeline_width, 6);
        assert_eq!(config.timed_wait, Duration::from_secs(10));
    }

    #[test]
    fn test_worklist_covers_subranges() {
        let mut list = Worklist::default();
        list.slots.insert(
            0,
            Slot {
                task: task("/alice", 3, 9),
                state: SlotState::TimedWait {
                    until: Instant::now(),
                },
            },
        );
        list.order.push_back(0);

        assert!(list.covers(&task("/alice", 3, 9)));
        assert!(list.covers(&task("/alice", 4, 5)));
        assert!(!list.covers(&task("/alice", 8, 10)));
        assert!(!list.covers(&task("/bob", 3, 9)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_span_skips_finished_entries() {
        let mut list = Worklist::default();
        let done = SlotState::TimedWait {
            until: Instant::now(),
        };
        for (id, (min, max), state) in [
            (0, (1, 3), done),
            (1, (7, 9), SlotState::Active(None)),
            (2, (4, 5), SlotState::Active(None)),
        ] {
            list.slots.insert(
                id,
                Slot {
                    task: task("/alice", min, max),
                    state,
                },
            );
            list.order.push_back(id);
        }

        let span = list.live_span_for(&task("/alice", 1, 1).key()).unwrap();
        assert_eq!((span.min_seq, span.max_seq), (4, 9));
        assert!(list.live_span_for(&task("/bob", 1, 1).key()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_removes_expired_timed_wait() {
        let mut list = Worklist::default();
        let now = Instant::now();
        for (id, offset) in [(0u64, 0u64), (1, 5)] {
            list.slots.insert(
                id,
                Slot {
                    task: task("/alice", id, id),
                    state: SlotState::TimedWait {
                        until: now + Duration::from_secs(offset),
                    },
                },
            );
            list.order.push_back(id);
        }

        list.purge_timed_wait(now);
        assert_eq!(list.order, VecDeque::from(vec![1]));
        assert!(list.slots.contains_key(&1));
    }
}
