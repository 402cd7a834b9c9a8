//! Test fixtures and helpers.
//!
//! Common setup code for multi-node tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;

use driftsync::{ActionSink, ActionSource, FetchConfig, Node, NodeConfig, Result};
use driftsync_core::{DeviceId, Name};
use driftsync_store::MemoryStore;
use driftsync_sync::{verify_convergence, MemoryNetwork, SyncConfig, Transport};

/// Parse a device name, panicking on malformed input.
pub fn device(name: &str) -> DeviceId {
    name.parse().expect("valid device name")
}

/// A device name no other call returns, e.g. `/test/3fa2c1d0`.
pub fn random_device() -> DeviceId {
    let mut suffix = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut suffix);
    DeviceId::new(Name::new().append("test").append(hex::encode(suffix)))
}

/// Install a test-writer subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Node configuration with timers short enough for paused-clock tests.
pub fn fast_config() -> NodeConfig {
    NodeConfig::default()
        .with_sync(SyncConfig::default().with_sync_interval(Duration::from_secs(1)))
        .with_fetch(
            FetchConfig::default()
                .with_segment_timeout(Duration::from_secs(2))
                .with_max_retry_pause(Duration::from_secs(4))
                .with_timed_wait(Duration::from_secs(1)),
        )
}

/// Poll `check` every 50ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Action log
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct LogState {
    local: Vec<Bytes>,
    applied: BTreeMap<DeviceId, BTreeMap<u64, Bytes>>,
    completed: Vec<(DeviceId, u64, u64)>,
}

/// An action log kept in memory.
///
/// Local records are numbered from 1. Records fetched from peers are kept
/// per producer.
#[derive(Debug, Default)]
pub struct MemoryActionLog {
    state: Mutex<LogState>,
}

impl MemoryActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a local record and return its sequence number.
    pub fn append(&self, action: impl Into<Bytes>) -> u64 {
        let mut state = self.lock();
        state.local.push(action.into());
        state.local.len() as u64
    }

    /// Highest local sequence number.
    pub fn local_len(&self) -> u64 {
        self.lock().local.len() as u64
    }

    /// Records applied from `producer`, in sequence order.
    pub fn applied_from(&self, producer: &DeviceId) -> Vec<(u64, Bytes)> {
        self.lock()
            .applied
            .get(producer)
            .map(|records| records.iter().map(|(s, a)| (*s, a.clone())).collect())
            .unwrap_or_default()
    }

    /// Highest contiguous sequence applied from `producer`.
    pub fn applied_through(&self, producer: &DeviceId) -> u64 {
        let state = self.lock();
        let Some(records) = state.applied.get(producer) else {
            return 0;
        };
        let mut next = 1;
        while records.contains_key(&next) {
            next += 1;
        }
        next - 1
    }

    /// `(producer, min, max)` of every completed range, in completion order.
    pub fn completed(&self) -> Vec<(DeviceId, u64, u64)> {
        self.lock().completed.clone()
    }
}

#[async_trait]
impl ActionSource for MemoryActionLog {
    async fn lookup_action(&self, seq: u64) -> Option<Bytes> {
        let index = usize::try_from(seq.checked_sub(1)?).ok()?;
        self.lock().local.get(index).cloned()
    }
}

#[async_trait]
impl ActionSink for MemoryActionLog {
    async fn apply_action(&self, producer: &DeviceId, seq: u64, action: Bytes) {
        self.lock()
            .applied
            .entry(producer.clone())
            .or_default()
            .insert(seq, action);
    }

    async fn range_complete(&self, producer: &DeviceId, min_seq: u64, max_seq: u64) {
        self.lock()
            .completed
            .push((producer.clone(), min_seq, max_seq));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Nodes
// ─────────────────────────────────────────────────────────────────────────────

/// A node over a memory store with an in-memory action log.
pub struct TestNode {
    pub node: Node<MemoryStore>,
    pub store: Arc<MemoryStore>,
    pub log: Arc<MemoryActionLog>,
}

impl TestNode {
    /// Start a node named `device` on `network`.
    pub async fn start(
        network: &Arc<MemoryNetwork>,
        device: DeviceId,
        config: NodeConfig,
    ) -> Result<Self> {
        Self::start_with_store(network, device, Arc::new(MemoryStore::new()), config).await
    }

    /// Start a node over an existing store, e.g. to simulate a restart.
    pub async fn start_with_store(
        network: &Arc<MemoryNetwork>,
        device: DeviceId,
        store: Arc<MemoryStore>,
        config: NodeConfig,
    ) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(network.create_transport().await);
        let log = Arc::new(MemoryActionLog::new());
        let node = Node::start(
            device,
            Arc::clone(&store),
            transport,
            Arc::clone(&log) as Arc<dyn ActionSource>,
            Arc::clone(&log) as Arc<dyn ActionSink>,
            config,
        )
        .await?;
        Ok(Self { node, store, log })
    }

    pub fn device(&self) -> &DeviceId {
        self.node.device()
    }

    /// Append a local record and announce it.
    pub async fn append_and_publish(&self, action: impl Into<Bytes>) -> Result<u64> {
        let seq = self.log.append(action);
        self.node.publish(seq).await?;
        Ok(seq)
    }

    /// Whether this node has applied every record `other` produced.
    pub fn caught_up_with(&self, other: &TestNode) -> bool {
        self.log.applied_through(other.device()) >= other.log.local_len()
    }
}

/// Start `count` nodes named `/device-0`, `/device-1`, ... on one network.
pub async fn multi_node_fixtures(
    network: &Arc<MemoryNetwork>,
    count: usize,
    config: NodeConfig,
) -> Result<Vec<TestNode>> {
    let mut nodes = Vec::with_capacity(count);
    for i in 0..count {
        let name = device(&format!("/device-{}", i));
        nodes.push(TestNode::start(network, name, config.clone()).await?);
    }
    Ok(nodes)
}

/// Whether every node's digest log holds the same state as the first's.
pub async fn all_converged(nodes: &[TestNode]) -> Result<bool> {
    let Some((first, rest)) = nodes.split_first() else {
        return Ok(true);
    };
    for node in rest {
        let result = verify_convergence(first.store.as_ref(), node.store.as_ref()).await?;
        if !result.is_converged() {
            return Ok(false);
        }
    }
    Ok(true)
}
