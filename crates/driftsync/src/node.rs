//! The Node: one device taking part in DriftSync.
//!
//! A node owns a [`SyncCore`] and a [`FetchManager`] over one transport and
//! one store. State changes reported by sync are dispatched as fetch tasks
//! for the producers' action logs, and the local action log is served to
//! peers under the device's own name.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use driftsync_core::{DeltaRecord, DeviceId, Digest, FetchTask, Name, Priority};
use driftsync_fetch::{
    broadcast_prefix, FetchConfig, FetchError, FetchHandler, FetchManager, LocatorTable,
    NameResolver,
};
use driftsync_store::{DigestLog, TaskStore};
use driftsync_sync::{
    Data, InterestReceiver, StateChangeCallback, SyncConfig, SyncCore, Transport,
};

use crate::error::{NodeError, Result};

/// Default freshness of served action segments.
pub const DEFAULT_SEGMENT_FRESHNESS: Duration = Duration::from_secs(10);

/// Configuration for a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Sync protocol configuration.
    pub sync: SyncConfig,
    /// Fetch pipeline configuration.
    pub fetch: FetchConfig,
    /// Component appended to a device name to name its action log.
    pub action_component: String,
    /// Prefix this device is reachable under, shared with peers.
    pub locator: Option<Name>,
    /// Freshness period of served action segments.
    pub segment_freshness: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            fetch: FetchConfig::default(),
            action_component: "actions".to_string(),
            locator: None,
            segment_freshness: DEFAULT_SEGMENT_FRESHNESS,
        }
    }
}

impl NodeConfig {
    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_fetch(mut self, fetch: FetchConfig) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn with_locator(mut self, locator: Name) -> Self {
        self.locator = Some(locator);
        self
    }

    /// Name of `device`'s action log, e.g. `/alice/actions`.
    pub fn action_base(&self, device: &DeviceId) -> Name {
        device
            .as_name()
            .clone()
            .append(self.action_component.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Collaborators
// ─────────────────────────────────────────────────────────────────────────────

/// Serves records of the local device's action log to peers.
#[async_trait]
pub trait ActionSource: Send + Sync {
    /// The encoded record at `seq`, if the log has it.
    async fn lookup_action(&self, seq: u64) -> Option<Bytes>;
}

/// Receives records fetched from other devices.
#[async_trait]
pub trait ActionSink: Send + Sync {
    /// One record of `producer`'s log arrived. Records may arrive out of order.
    async fn apply_action(&self, producer: &DeviceId, seq: u64, action: Bytes);

    /// Every record in `[min_seq, max_seq]` of `producer`'s log was applied.
    async fn range_complete(&self, producer: &DeviceId, min_seq: u64, max_seq: u64);
}

struct ApplyActions {
    sink: Arc<dyn ActionSink>,
}

#[async_trait]
impl FetchHandler for ApplyActions {
    async fn on_segment(&self, task: &FetchTask, seq: u64, content: Bytes) {
        self.sink.apply_action(&task.producer, seq, content).await;
    }

    async fn on_finish(&self, task: &FetchTask) {
        self.sink
            .range_complete(&task.producer, task.min_seq, task.max_seq)
            .await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Node
// ─────────────────────────────────────────────────────────────────────────────

/// A running DriftSync device.
pub struct Node<S> {
    device: DeviceId,
    store: Arc<S>,
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    sync: SyncCore,
    fetch: Arc<FetchManager>,
    locators: Arc<LocatorTable>,
    handler: Arc<dyn FetchHandler>,
    served: Vec<Name>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl<S> Node<S>
where
    S: DigestLog + TaskStore + 'static,
{
    /// Start a node.
    ///
    /// Records the configured locator, restores persisted fetch tasks,
    /// starts serving the local action log and joins the sync group.
    pub async fn start(
        device: DeviceId,
        store: Arc<S>,
        transport: Arc<dyn Transport>,
        source: Arc<dyn ActionSource>,
        sink: Arc<dyn ActionSink>,
        config: NodeConfig,
    ) -> Result<Self> {
        if let Some(locator) = &config.locator {
            store.update_locator(&device, locator).await?;
        }

        let locators = Arc::new(LocatorTable::new());
        for (producer, _) in store.current_state().await?.iter() {
            if let Some(locator) = store.locator(producer).await? {
                locators.insert(producer.clone(), locator);
            }
        }

        let fetch = Arc::new(FetchManager::new(
            Arc::clone(&transport),
            Arc::clone(&store) as Arc<dyn TaskStore>,
            Arc::clone(&locators) as Arc<dyn NameResolver>,
            config.fetch.clone(),
        ));
        let handler: Arc<dyn FetchHandler> = Arc::new(ApplyActions { sink });
        let restored = fetch.restore(Arc::clone(&handler)).await?;
        fetch.start();

        let base = config.action_base(&device);
        let mut served = vec![base.clone(), broadcast_prefix().append_name(&base)];
        if let Some(locator) = config.locator.as_ref().filter(|l| !l.is_empty()) {
            served.push(locator.clone().append_name(&base));
        }

        let mut tasks = Vec::with_capacity(served.len() + 1);
        for prefix in &served {
            let interests = match transport.register_prefix(prefix).await {
                Ok(interests) => interests,
                Err(e) => {
                    abandon(transport.as_ref(), &served[..tasks.len()], tasks, &fetch).await;
                    return Err(e.into());
                }
            };
            tasks.push(tokio::spawn(serve_actions(
                prefix.clone(),
                interests,
                Arc::clone(&transport),
                Arc::clone(&source),
                config.segment_freshness,
            )));
        }

        let (delta_tx, delta_rx) = mpsc::unbounded_channel::<Vec<DeltaRecord>>();
        let callback: StateChangeCallback = Arc::new(move |delta: Vec<DeltaRecord>| {
            if delta_tx.send(delta).is_err() {
                trace!("dispatcher gone, dropping delta");
            }
        });
        let sync = match SyncCore::spawn(
            Arc::clone(&store),
            Arc::clone(&transport),
            device.clone(),
            config.sync.clone(),
            callback,
        )
        .await
        {
            Ok(sync) => sync,
            Err(e) => {
                abandon(transport.as_ref(), &served, tasks, &fetch).await;
                return Err(e.into());
            }
        };

        let dispatcher = Dispatcher {
            device: device.clone(),
            config: config.clone(),
            fetch: Arc::clone(&fetch),
            locators: Arc::clone(&locators),
            handler: Arc::clone(&handler),
        };
        tasks.push(tokio::spawn(dispatcher.run(delta_rx)));

        info!(%device, restored, root = %sync.root_digest(), "node started");

        Ok(Self {
            device,
            store,
            config,
            transport,
            sync,
            fetch,
            locators,
            handler,
            served,
            tasks: Mutex::new(tasks),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn sync(&self) -> &SyncCore {
        &self.sync
    }

    pub fn fetch(&self) -> &FetchManager {
        &self.fetch
    }

    /// Locators learned from peers.
    pub fn locators(&self) -> &LocatorTable {
        &self.locators
    }

    pub fn root_digest(&self) -> Digest {
        self.sync.root_digest()
    }

    /// Highest sequence published for the local device (0 if none).
    pub async fn local_seq(&self) -> Result<u64> {
        Ok(self.store.device_seq(&self.device).await?.unwrap_or(0))
    }

    /// Announce that the local action log now ends at `seq`.
    ///
    /// The record must already be available from the node's
    /// [`ActionSource`].
    pub async fn publish(&self, seq: u64) -> Result<Digest> {
        self.ensure_running()?;
        let digest = self.sync.publish_local_seq(seq).await?;
        debug!(device = %self.device, seq, %digest, "published local action");
        Ok(digest)
    }

    /// Fetch `[min_seq, max_seq]` of `producer`'s action log.
    ///
    /// Returns false when the range is empty or already being fetched.
    pub async fn request(
        &self,
        producer: DeviceId,
        min_seq: u64,
        max_seq: u64,
        priority: Priority,
    ) -> Result<bool> {
        self.ensure_running()?;
        let base = self.config.action_base(&producer);
        let task = FetchTask::new(producer, base, min_seq, max_seq, priority);
        Ok(self.fetch.enqueue(task, Arc::clone(&self.handler)).await?)
    }

    /// Stop syncing, fetching and serving.
    ///
    /// Persisted fetch tasks survive for the next start. Calling this twice
    /// is a no-op.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sync.shutdown().await;
        self.fetch.shutdown();
        for prefix in &self.served {
            self.transport.unregister_prefix(prefix).await;
        }
        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
        info!(device = %self.device, "node stopped");
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(NodeError::ShutDown)
        } else {
            Ok(())
        }
    }
}

impl<S> Drop for Node<S> {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch and serving
// ─────────────────────────────────────────────────────────────────────────────

/// Turns sync deltas into fetch tasks.
struct Dispatcher {
    device: DeviceId,
    config: NodeConfig,
    fetch: Arc<FetchManager>,
    locators: Arc<LocatorTable>,
    handler: Arc<dyn FetchHandler>,
}

impl Dispatcher {
    async fn run(self, mut deltas: mpsc::UnboundedReceiver<Vec<DeltaRecord>>) {
        while let Some(delta) = deltas.recv().await {
            for record in delta {
                if !self.dispatch(record).await {
                    debug!("fetch manager stopped, dispatcher exiting");
                    return;
                }
            }
        }
    }

    /// Returns false once the fetch manager refuses new work.
    async fn dispatch(&self, record: DeltaRecord) -> bool {
        if record.device == self.device {
            return true;
        }
        if let Some(locator) = &record.locator {
            self.locators.insert(record.device.clone(), locator.clone());
        }
        let Some((min_seq, max_seq)) = record.missing_range() else {
            return true;
        };

        let base = self.config.action_base(&record.device);
        let task = FetchTask::new(record.device, base, min_seq, max_seq, Priority::Normal);
        let producer = task.producer.clone();
        match self.fetch.enqueue(task, Arc::clone(&self.handler)).await {
            Ok(true) => {
                debug!(%producer, min_seq, max_seq, "enqueued action fetch");
                true
            }
            Ok(false) => {
                trace!(%producer, min_seq, max_seq, "action range already covered");
                true
            }
            Err(FetchError::Stopped) => false,
            Err(e) => {
                warn!(%producer, error = %e, "failed to enqueue action fetch");
                true
            }
        }
    }
}

/// Undo a partial start.
async fn abandon(
    transport: &dyn Transport,
    prefixes: &[Name],
    tasks: Vec<JoinHandle<()>>,
    fetch: &FetchManager,
) {
    for task in tasks {
        task.abort();
    }
    for prefix in prefixes {
        transport.unregister_prefix(prefix).await;
    }
    fetch.shutdown();
}

/// Answer segment interests under `prefix` from the local action log.
async fn serve_actions(
    prefix: Name,
    mut interests: InterestReceiver,
    transport: Arc<dyn Transport>,
    source: Arc<dyn ActionSource>,
    freshness: Duration,
) {
    while let Some(interest) = interests.recv().await {
        let seq = match interest.name.strip_prefix(&prefix) {
            Some(rest) if rest.len() == 1 => rest.last_number(),
            _ => None,
        };
        let Some(seq) = seq else {
            trace!(name = %interest.name, "ignoring interest for non-segment name");
            continue;
        };
        let Some(action) = source.lookup_action(seq).await else {
            trace!(seq, "action not in local log");
            continue;
        };
        let data = Data::new(interest.name, action).with_freshness(freshness);
        if let Err(e) = transport.put_data(data).await {
            warn!(seq, error = %e, "failed to serve action");
        }
    }
    debug!(%prefix, "action server stopped");
}
