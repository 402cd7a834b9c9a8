//! End-to-end fetch scenarios over the in-memory network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use driftsync_core::{DeviceId, FetchTask, Name, Priority};
use driftsync_fetch::{
    broadcast_prefix, FetchConfig, FetchError, FetchHandler, FetchManager, FetcherState,
    LocatorTable,
};
use driftsync_store::{MemoryStore, TaskStore};
use driftsync_sync::{Data, MemoryNetwork, Transport};

type Seen = Arc<Mutex<Vec<(Instant, Name)>>>;

#[derive(Default)]
struct Recorder {
    segments: Mutex<Vec<(DeviceId, u64)>>,
    finished: Mutex<Vec<FetchTask>>,
}

impl Recorder {
    fn segments_of(&self, producer: &str) -> Vec<u64> {
        let producer: DeviceId = producer.parse().unwrap();
        let mut seqs: Vec<u64> = self
            .segments
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| *p == producer)
            .map(|(_, s)| *s)
            .collect();
        seqs.sort_unstable();
        seqs
    }

    fn finished_count(&self) -> usize {
        self.finished.lock().unwrap().len()
    }
}

#[async_trait]
impl FetchHandler for Recorder {
    async fn on_segment(&self, task: &FetchTask, seq: u64, _content: Bytes) {
        self.segments
            .lock()
            .unwrap()
            .push((task.producer.clone(), seq));
    }

    async fn on_finish(&self, task: &FetchTask) {
        self.finished.lock().unwrap().push(task.clone());
    }
}

struct Served {
    seen: Seen,
    max_outstanding: Arc<AtomicUsize>,
}

/// Answer interests under `prefixes` after `delay`, as `respond` decides.
///
/// `respond` gets the interest name and how many times it has been seen.
async fn serve<F>(
    network: &Arc<MemoryNetwork>,
    prefixes: Vec<Name>,
    delay: Duration,
    respond: F,
) -> Served
where
    F: Fn(&Name, usize) -> Option<Bytes> + Send + Sync + 'static,
{
    let face = Arc::new(network.create_transport().await);
    let seen: Seen = Arc::default();
    let outstanding = Arc::new(AtomicUsize::new(0));
    let max_outstanding = Arc::new(AtomicUsize::new(0));
    let respond = Arc::new(respond);

    for prefix in prefixes {
        let mut interests = face.register_prefix(&prefix).await.unwrap();
        let face = Arc::clone(&face);
        let seen = Arc::clone(&seen);
        let respond = Arc::clone(&respond);
        let outstanding = Arc::clone(&outstanding);
        let max_outstanding = Arc::clone(&max_outstanding);

        tokio::spawn(async move {
            while let Some(interest) = interests.recv().await {
                let count = {
                    let mut seen = seen.lock().unwrap();
                    seen.push((Instant::now(), interest.name.clone()));
                    seen.iter().filter(|(_, n)| *n == interest.name).count()
                };
                let Some(content) = respond(&interest.name, count) else {
                    continue;
                };

                let now = outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                max_outstanding.fetch_max(now, Ordering::SeqCst);
                let face = Arc::clone(&face);
                let outstanding = Arc::clone(&outstanding);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    outstanding.fetch_sub(1, Ordering::SeqCst);
                    let _ = face.put_data(Data::new(interest.name, content)).await;
                });
            }
        });
    }

    Served {
        seen,
        max_outstanding,
    }
}

fn always(_: &Name, _: usize) -> Option<Bytes> {
    Some(Bytes::from_static(b"segment"))
}

fn never(_: &Name, _: usize) -> Option<Bytes> {
    None
}

fn name(s: &str) -> Name {
    s.parse().unwrap()
}

fn task(producer: &str, min: u64, max: u64, priority: Priority) -> FetchTask {
    FetchTask::new(
        producer.parse().unwrap(),
        name(&format!("{}/actions", producer)),
        min,
        max,
        priority,
    )
}

async fn manager(
    network: &Arc<MemoryNetwork>,
    store: Arc<MemoryStore>,
    resolver: LocatorTable,
    config: FetchConfig,
) -> FetchManager {
    let transport: Arc<dyn Transport> = Arc::new(network.create_transport().await);
    FetchManager::new(transport, store, Arc::new(resolver), config)
}

async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test(start_paused = true)]
async fn test_fetches_whole_range_with_bounded_window() {
    let network = MemoryNetwork::new();
    let served = serve(
        &network,
        vec![name("/alice/actions")],
        Duration::from_millis(10),
        always,
    )
    .await;
    let store = Arc::new(MemoryStore::new());
    let manager = manager(
        &network,
        Arc::clone(&store),
        LocatorTable::new(),
        FetchConfig::default(),
    )
    .await;
    manager.start();

    let recorder = Arc::new(Recorder::default());
    let task = task("/alice", 0, 9, Priority::Normal);
    assert!(manager.enqueue(task.clone(), recorder.clone()).await.unwrap());
    assert!(store.has_task(&task.key()).await.unwrap());

    assert!(wait_for(|| recorder.finished_count() == 1 && manager.active_count() == 0).await);
    assert_eq!(recorder.segments_of("/alice"), (0..=9).collect::<Vec<_>>());
    assert_eq!(recorder.segments.lock().unwrap().len(), 10);
    assert!(!store.has_task(&task.key()).await.unwrap());
    assert_eq!(served.max_outstanding.load(Ordering::SeqCst), 6);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(recorder.finished_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_data_backs_off_and_alternates_hints() {
    let network = MemoryNetwork::new();
    let served = serve(
        &network,
        vec![broadcast_prefix(), name("/isp/alice")],
        Duration::ZERO,
        never,
    )
    .await;

    let resolver = LocatorTable::new();
    resolver.insert("/alice".parse().unwrap(), name("/isp/alice"));
    let config = FetchConfig::default()
        .with_pipeline_width(1)
        .with_segment_timeout(Duration::from_secs(5))
        .with_max_retry_pause(Duration::from_secs(4));
    let manager = manager(&network, Arc::new(MemoryStore::new()), resolver, config).await;
    manager.start();

    let recorder = Arc::new(Recorder::default());
    manager
        .enqueue(task("/alice", 0, 0, Priority::Normal), recorder.clone())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(31_500)).await;

    let seen = served.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 5, "attempts: {:?}", seen);

    let via_broadcast: Vec<bool> = seen
        .iter()
        .map(|(_, n)| broadcast_prefix().is_prefix_of(n))
        .collect();
    assert_eq!(via_broadcast, vec![false, true, false, true, false]);
    assert!(name("/isp/alice").is_prefix_of(&seen[0].1));

    let pauses: Vec<Duration> = seen
        .windows(2)
        .map(|w| w[1].0 - w[0].0 - Duration::from_secs(5))
        .collect();
    let expected = [1, 2, 4, 4].map(Duration::from_secs);
    for (pause, want) in pauses.iter().zip(expected) {
        let drift = if *pause > want { *pause - want } else { want - *pause };
        assert!(drift < Duration::from_millis(50), "pauses: {:?}", pauses);
    }
    assert_eq!(recorder.finished_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_high_priority_is_scheduled_first() {
    let network = MemoryNetwork::new();
    let served = serve(
        &network,
        vec![name("/alice/actions"), name("/bob/actions")],
        Duration::from_millis(10),
        always,
    )
    .await;
    let config = FetchConfig::default().with_max_parallel_fetches(1);
    let manager = manager(&network, Arc::new(MemoryStore::new()), LocatorTable::new(), config).await;

    let recorder = Arc::new(Recorder::default());
    manager
        .enqueue(task("/alice", 1, 3, Priority::Normal), recorder.clone())
        .await
        .unwrap();
    manager
        .enqueue(task("/bob", 1, 3, Priority::High), recorder.clone())
        .await
        .unwrap();
    manager.start();

    assert!(wait_for(|| recorder.finished_count() == 2).await);

    let first = served.seen.lock().unwrap()[0].1.clone();
    assert!(name("/bob/actions").is_prefix_of(&first));
    let order: Vec<String> = recorder
        .finished
        .lock()
        .unwrap()
        .iter()
        .map(|t| t.producer.to_string())
        .collect();
    assert_eq!(order, vec!["/bob", "/alice"]);
}

#[tokio::test(start_paused = true)]
async fn test_gap_is_retried_without_failing() {
    let network = MemoryNetwork::new();
    let served = serve(
        &network,
        vec![name("/alice/actions")],
        Duration::from_millis(100),
        |name, count| {
            if name.last_number() == Some(4) && count == 1 {
                None
            } else {
                Some(Bytes::from_static(b"segment"))
            }
        },
    )
    .await;
    let config = FetchConfig::default().with_segment_timeout(Duration::from_secs(5));
    let manager = manager(&network, Arc::new(MemoryStore::new()), LocatorTable::new(), config).await;
    manager.start();

    let recorder = Arc::new(Recorder::default());
    manager
        .enqueue(task("/alice", 0, 9, Priority::Normal), recorder.clone())
        .await
        .unwrap();

    assert!(wait_for(|| recorder.finished_count() == 1).await);
    assert_eq!(recorder.segments_of("/alice"), (0..=9).collect::<Vec<_>>());

    let seen = served.seen.lock().unwrap().clone();
    let seq4 = seen
        .iter()
        .filter(|(_, n)| n.last_number() == Some(4))
        .count();
    assert_eq!(seq4, 2);
    assert!(seen.iter().all(|(_, n)| !broadcast_prefix().is_prefix_of(n)));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_aborts_and_forgets_task() {
    let network = MemoryNetwork::new();
    let _served = serve(&network, vec![name("/alice/actions")], Duration::ZERO, never).await;
    let store = Arc::new(MemoryStore::new());
    let manager = manager(
        &network,
        Arc::clone(&store),
        LocatorTable::new(),
        FetchConfig::default(),
    )
    .await;
    manager.start();

    let recorder = Arc::new(Recorder::default());
    let task = task("/alice", 0, 4, Priority::Normal);
    manager.enqueue(task.clone(), recorder.clone()).await.unwrap();
    assert!(wait_for(|| manager.active_count() == 1).await);

    assert!(manager
        .cancel(&task.producer, &task.base_name)
        .await
        .unwrap());
    assert!(manager.is_empty());
    assert_eq!(manager.active_count(), 0);
    assert!(!store.has_task(&task.key()).await.unwrap());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(recorder.finished_count(), 0);
    assert!(!manager
        .cancel(&task.producer, &task.base_name)
        .await
        .unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_restore_resumes_persisted_tasks() {
    let network = MemoryNetwork::new();
    let _served = serve(
        &network,
        vec![name("/alice/actions"), name("/bob/actions")],
        Duration::from_millis(10),
        always,
    )
    .await;
    let store = Arc::new(MemoryStore::new());
    store
        .save_task(&task("/alice", 5, 7, Priority::Normal))
        .await
        .unwrap();
    store
        .save_task(&task("/bob", 1, 2, Priority::High))
        .await
        .unwrap();

    let manager = manager(
        &network,
        Arc::clone(&store),
        LocatorTable::new(),
        FetchConfig::default(),
    )
    .await;
    let recorder = Arc::new(Recorder::default());
    assert_eq!(manager.restore(recorder.clone()).await.unwrap(), 2);
    manager.start();

    assert!(wait_for(|| recorder.finished_count() == 2 && manager.active_count() == 0).await);
    assert_eq!(recorder.segments_of("/alice"), vec![5, 6, 7]);
    assert_eq!(recorder.segments_of("/bob"), vec![1, 2]);
    assert!(store.list_tasks().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_finished_fetcher_lingers_in_timed_wait() {
    let network = MemoryNetwork::new();
    let _served = serve(
        &network,
        vec![name("/alice/actions")],
        Duration::from_millis(10),
        always,
    )
    .await;
    let store = Arc::new(MemoryStore::new());
    let manager = manager(
        &network,
        Arc::clone(&store),
        LocatorTable::new(),
        FetchConfig::default(),
    )
    .await;
    manager.start();

    let recorder = Arc::new(Recorder::default());
    let task = task("/alice", 0, 2, Priority::Normal);
    manager.enqueue(task.clone(), recorder.clone()).await.unwrap();
    assert!(wait_for(|| recorder.finished_count() == 1 && manager.active_count() == 0).await);

    let fetchers = manager.fetchers();
    assert_eq!(fetchers.len(), 1);
    assert!(matches!(fetchers[0].1, FetcherState::TimedWait { .. }));

    // A late duplicate of the finished range is absorbed.
    assert!(!manager.enqueue(task.clone(), recorder.clone()).await.unwrap());
    assert!(!store.has_task(&task.key()).await.unwrap());

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(manager.is_empty());
    assert_eq!(recorder.finished_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_empty_range_and_shutdown() {
    let network = MemoryNetwork::new();
    let store = Arc::new(MemoryStore::new());
    let manager = manager(
        &network,
        Arc::clone(&store),
        LocatorTable::new(),
        FetchConfig::default(),
    )
    .await;
    let recorder = Arc::new(Recorder::default());

    let empty = task("/alice", 5, 4, Priority::Normal);
    assert!(!manager.enqueue(empty.clone(), recorder.clone()).await.unwrap());
    assert!(!store.has_task(&empty.key()).await.unwrap());
    assert!(manager.is_empty());

    manager.shutdown();
    assert!(matches!(
        manager
            .enqueue(task("/alice", 0, 1, Priority::Normal), recorder.clone())
            .await,
        Err(FetchError::Stopped)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_restart_resumes_every_enqueued_range() {
    let network = MemoryNetwork::new();
    let _served = serve(
        &network,
        vec![name("/alice/actions")],
        Duration::from_millis(10),
        always,
    )
    .await;
    let store = Arc::new(MemoryStore::new());
    let recorder = Arc::new(Recorder::default());

    let first = manager(
        &network,
        Arc::clone(&store),
        LocatorTable::new(),
        FetchConfig::default(),
    )
    .await;
    assert!(first
        .enqueue(task("/alice", 1, 3, Priority::Normal), recorder.clone())
        .await
        .unwrap());
    assert!(first
        .enqueue(task("/alice", 4, 6, Priority::Normal), recorder.clone())
        .await
        .unwrap());
    assert_eq!(
        store.list_tasks().await.unwrap(),
        vec![task("/alice", 1, 6, Priority::Normal)]
    );
    drop(first);

    let second = manager(
        &network,
        Arc::clone(&store),
        LocatorTable::new(),
        FetchConfig::default(),
    )
    .await;
    assert_eq!(second.restore(recorder.clone()).await.unwrap(), 1);
    second.start();

    assert!(wait_for(|| recorder.finished_count() == 1 && second.active_count() == 0).await);
    assert_eq!(recorder.segments_of("/alice"), vec![1, 2, 3, 4, 5, 6]);
    assert!(store.list_tasks().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_finished_range_keeps_pending_range_persisted() {
    let network = MemoryNetwork::new();
    let _served = serve(
        &network,
        vec![name("/alice/actions")],
        Duration::from_millis(10),
        |name: &Name, _| {
            name.last_number()
                .filter(|seq| *seq <= 3)
                .map(|_| Bytes::from_static(b"segment"))
        },
    )
    .await;
    let store = Arc::new(MemoryStore::new());
    let manager = manager(
        &network,
        Arc::clone(&store),
        LocatorTable::new(),
        FetchConfig::default(),
    )
    .await;
    let recorder = Arc::new(Recorder::default());
    manager
        .enqueue(task("/alice", 1, 3, Priority::High), recorder.clone())
        .await
        .unwrap();
    manager
        .enqueue(task("/alice", 4, 6, Priority::Normal), recorder.clone())
        .await
        .unwrap();
    manager.start();

    assert!(wait_for(|| recorder.finished_count() == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        store.list_tasks().await.unwrap(),
        vec![task("/alice", 4, 6, Priority::Normal)]
    );
    manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_duplicates_enqueue_once() {
    let network = MemoryNetwork::new();
    let store = Arc::new(MemoryStore::new());
    let manager = manager(
        &network,
        Arc::clone(&store),
        LocatorTable::new(),
        FetchConfig::default(),
    )
    .await;
    let recorder = Arc::new(Recorder::default());

    let (a, b) = tokio::join!(
        manager.enqueue(task("/alice", 1, 4, Priority::Normal), recorder.clone()),
        manager.enqueue(task("/alice", 1, 4, Priority::Normal), recorder.clone()),
    );
    assert_eq!(
        [a.unwrap(), b.unwrap()].iter().filter(|added| **added).count(),
        1
    );
    assert_eq!(manager.len(), 1);
    assert_eq!(store.list_tasks().await.unwrap().len(), 1);
}
