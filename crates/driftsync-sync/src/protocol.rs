//! Sync protocol state machine.
//!
//! One event-loop task per device owns all protocol state. It advertises the
//! local digest on a timer, answers peers' advertisements with deltas, runs
//! bounded-wait recovery for digests it has never seen, and merges whatever
//! replies come back into the [`DigestLog`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use driftsync_core::{DeltaRecord, DeviceId, Digest, Name};
use driftsync_store::DigestLog;

use crate::error::{Result, SyncError};
use crate::messages::{SyncName, SyncStateMsg};
use crate::transport::{Data, Interest, InterestReceiver, Transport};

/// Upper bound on the advertisement interval.
pub const MAX_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration for sync behavior.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Broadcast prefix shared by every device in the group.
    pub sync_prefix: Name,
    /// Period between advertisements of the local digest.
    pub sync_interval: Duration,
    /// Delay before advertising after a local change.
    pub local_change_delay: Duration,
    /// Base wait before recovering an unknown digest.
    pub recover_wait: Duration,
    /// Total jitter applied to `recover_wait`, in percent.
    pub recover_jitter_percent: u8,
    /// Lifetime of advertisement interests.
    pub advert_lifetime: Duration,
    /// Lifetime of recovery interests.
    pub recovery_lifetime: Duration,
    /// Freshness period of delta replies.
    pub reply_freshness: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_prefix: Name::new()
                .append("ndn")
                .append("broadcast")
                .append("driftsync"),
            sync_interval: Duration::from_secs(4),
            local_change_delay: Duration::from_millis(50),
            recover_wait: Duration::from_millis(50),
            recover_jitter_percent: 50,
            advert_lifetime: Duration::from_secs(4),
            recovery_lifetime: Duration::from_secs(4),
            reply_freshness: Duration::from_secs(4),
        }
    }
}

impl SyncConfig {
    /// Set the sync prefix.
    pub fn with_prefix(mut self, prefix: Name) -> Self {
        self.sync_prefix = prefix;
        self
    }

    /// Set the advertisement interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Set the recovery wait and jitter.
    pub fn with_recover_wait(mut self, wait: Duration, jitter_percent: u8) -> Self {
        self.recover_wait = wait;
        self.recover_jitter_percent = jitter_percent;
        self
    }

    /// The advertisement interval actually used, clamped to [`MAX_SYNC_INTERVAL`].
    pub fn effective_sync_interval(&self) -> Duration {
        self.sync_interval.min(MAX_SYNC_INTERVAL)
    }

    /// Draw a recovery delay in `recover_wait * (1 ± jitter/2)`.
    fn recovery_delay(&self) -> Duration {
        let spread = f64::from(self.recover_jitter_percent.min(100)) / 100.0 / 2.0;
        if spread == 0.0 {
            return self.recover_wait;
        }
        let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        self.recover_wait.mul_f64(factor)
    }
}

/// Externally visible protocol phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Nothing outstanding.
    Idle,
    /// An advertisement is waiting for a reply.
    WaitingReply,
    /// An unknown digest is waiting out its recovery backoff or reply.
    RecoveryPending,
}

/// Invoked with the local delta whenever merged replies change local state.
///
/// Records carry both old and new sequence numbers.
pub type StateChangeCallback = Arc<dyn Fn(Vec<DeltaRecord>) + Send + Sync>;

enum Command {
    LocalStateChanged(oneshot::Sender<Result<Digest>>),
    PublishLocalSeq {
        seq: u64,
        reply: oneshot::Sender<Result<Digest>>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Completions of work spawned by the event loop.
enum SyncEvent {
    AdvertReply { digest: Digest, data: Option<Data> },
    RecoverDue(Digest),
    RecoverReply { digest: Digest, data: Option<Data> },
}

/// Handle to a running sync protocol instance.
///
/// Cloning the handle is cheap. The event loop stops on [`SyncCore::shutdown`]
/// or when every handle has been dropped.
#[derive(Clone)]
pub struct SyncCore {
    device: DeviceId,
    commands: mpsc::Sender<Command>,
    root: watch::Receiver<Digest>,
    phase: watch::Receiver<SyncPhase>,
}

impl SyncCore {
    /// Start the protocol for `device`.
    ///
    /// Records the current state, registers the sync prefix and sends the
    /// first advertisement right away.
    pub async fn spawn<L, T>(
        log: Arc<L>,
        transport: Arc<T>,
        device: DeviceId,
        config: SyncConfig,
        callback: StateChangeCallback,
    ) -> Result<Self>
    where
        L: DigestLog + ?Sized + 'static,
        T: Transport + ?Sized + 'static,
    {
        let root = log.remember_state().await?;
        let interests = transport.register_prefix(&config.sync_prefix).await?;

        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (root_tx, root_rx) = watch::channel(root);
        let (phase_tx, phase_rx) = watch::channel(SyncPhase::Idle);

        info!(device = %device, prefix = %config.sync_prefix, root = %root, "sync started");

        let worker = Worker {
            log,
            transport,
            device: device.clone(),
            prefix: config.sync_prefix.clone(),
            config,
            callback,
            root,
            next_advert: Instant::now(),
            adverts_in_flight: 0,
            recoveries: HashSet::new(),
            tasks: JoinSet::new(),
            events: event_tx,
            root_tx,
            phase_tx,
        };
        tokio::spawn(worker.run(command_rx, interests, event_rx));

        Ok(Self {
            device,
            commands: command_tx,
            root: root_rx,
            phase: phase_rx,
        })
    }

    /// The local device.
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// The current root digest.
    pub fn root_digest(&self) -> Digest {
        *self.root.borrow()
    }

    /// The current protocol phase.
    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    /// Watch root digest changes.
    pub fn subscribe_root(&self) -> watch::Receiver<Digest> {
        self.root.clone()
    }

    /// Tell the protocol the digest log changed locally.
    ///
    /// Publishes the delta under the previous digest and advertises the new
    /// digest after `local_change_delay`.
    pub async fn local_state_changed(&self) -> Result<Digest> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::LocalStateChanged(reply)).await?;
        rx.await.map_err(|_| SyncError::Stopped)?
    }

    /// Record a new local sequence number and announce it.
    pub async fn publish_local_seq(&self, seq: u64) -> Result<Digest> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::PublishLocalSeq { seq, reply }).await?;
        rx.await.map_err(|_| SyncError::Stopped)?
    }

    /// Stop the event loop and unregister the sync prefix.
    ///
    /// Calling this on a stopped instance is a no-op.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.request(Command::Shutdown(reply)).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn request(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::Stopped)
    }
}

struct Worker<L: ?Sized, T: ?Sized> {
    log: Arc<L>,
    transport: Arc<T>,
    device: DeviceId,
    prefix: Name,
    config: SyncConfig,
    callback: StateChangeCallback,
    root: Digest,
    next_advert: Instant,
    adverts_in_flight: usize,
    /// Digests with a scheduled or outstanding recovery.
    recoveries: HashSet<Digest>,
    tasks: JoinSet<()>,
    events: mpsc::UnboundedSender<SyncEvent>,
    root_tx: watch::Sender<Digest>,
    phase_tx: watch::Sender<SyncPhase>,
}

impl<L, T> Worker<L, T>
where
    L: DigestLog + ?Sized + 'static,
    T: Transport + ?Sized + 'static,
{
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut interests: InterestReceiver,
        mut events: mpsc::UnboundedReceiver<SyncEvent>,
    ) {
        loop {
            self.publish_phase();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::LocalStateChanged(reply)) => {
                        let _ = reply.send(self.local_state_changed().await);
                    }
                    Some(Command::PublishLocalSeq { seq, reply }) => {
                        let _ = reply.send(self.publish_local_seq(seq).await);
                    }
                    Some(Command::Shutdown(reply)) => {
                        self.stop().await;
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        self.stop().await;
                        return;
                    }
                },
                Some(interest) = interests.recv() => self.handle_interest(interest).await,
                Some(event) = events.recv() => self.handle_event(event).await,
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => {}
                _ = tokio::time::sleep_until(self.next_advert) => self.send_advertisement(),
            }
        }
    }

    fn publish_phase(&self) {
        let phase = if !self.recoveries.is_empty() {
            SyncPhase::RecoveryPending
        } else if self.adverts_in_flight > 0 {
            SyncPhase::WaitingReply
        } else {
            SyncPhase::Idle
        };
        self.phase_tx.send_if_modified(|current| {
            let changed = *current != phase;
            *current = phase;
            changed
        });
    }

    fn set_root(&mut self, digest: Digest) {
        self.root = digest;
        self.root_tx.send_replace(digest);
    }

    async fn stop(&mut self) {
        if !self.transport.unregister_prefix(&self.prefix).await {
            warn!(prefix = %self.prefix, "sync prefix was not registered");
        }
        self.tasks.abort_all();
        self.recoveries.clear();
        self.adverts_in_flight = 0;
        self.publish_phase();
        info!(device = %self.device, "sync stopped");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local changes
    // ─────────────────────────────────────────────────────────────────────────

    async fn publish_local_seq(&mut self, seq: u64) -> Result<Digest> {
        self.log.update_device_seq(&self.device, seq).await?;
        self.local_state_changed().await
    }

    async fn local_state_changed(&mut self) -> Result<Digest> {
        let old = self.root;
        let new = self.log.remember_state().await?;

        if new != old {
            let delta = self.log.find_differences(&old, &new, false).await?;
            self.set_root(new);
            debug!(old = %old, new = %new, records = delta.len(), "local state changed");
            // Answers peers still waiting on our previous digest.
            let name = SyncName::Advertise(old).to_name(&self.prefix);
            self.reply(name, delta).await;
        }

        self.next_advert = Instant::now() + self.config.local_change_delay;
        Ok(new)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Incoming interests
    // ─────────────────────────────────────────────────────────────────────────

    async fn handle_interest(&mut self, interest: Interest) {
        let sync_name = match SyncName::parse(&self.prefix, &interest.name) {
            Ok(sync_name) => sync_name,
            Err(e) => {
                debug!(error = %e, "ignoring interest");
                return;
            }
        };

        let result = match sync_name {
            SyncName::Advertise(digest) => self.on_advertisement(digest, interest.name).await,
            SyncName::Recover(digest) => self.on_recovery_request(digest, interest.name).await,
        };
        if let Err(e) = result {
            error!(error = %e, "failed to answer sync interest");
        }
    }

    async fn on_advertisement(&mut self, digest: Digest, name: Name) -> Result<()> {
        if digest == self.root {
            trace!(digest = %digest, "peer is in sync");
            return Ok(());
        }

        if self.log.is_known_digest(&digest).await? {
            let delta = self.log.find_differences(&digest, &self.root, false).await?;
            debug!(digest = %digest, records = delta.len(), "answering advertisement");
            self.reply(name, delta).await;
        } else {
            self.schedule_recovery(digest);
        }
        Ok(())
    }

    async fn on_recovery_request(&mut self, digest: Digest, name: Name) -> Result<()> {
        if !self.log.is_known_digest(&digest).await? {
            trace!(digest = %digest, "cannot help recovery");
            return Ok(());
        }
        let full = self
            .log
            .find_differences(&Digest::origin(), &self.root, false)
            .await?;
        debug!(digest = %digest, records = full.len(), "answering recovery");
        self.reply(name, full).await;
        Ok(())
    }

    async fn reply(&self, name: Name, states: Vec<DeltaRecord>) {
        if states.is_empty() {
            return;
        }
        let content = match SyncStateMsg::new(states).encode() {
            Ok(content) => content,
            Err(e) => {
                error!(error = %e, "failed to encode sync reply");
                return;
            }
        };
        let data = Data::new(name, content).with_freshness(self.config.reply_freshness);
        if let Err(e) = self.transport.put_data(data).await {
            warn!(error = %e, "failed to publish sync reply");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outgoing interests
    // ─────────────────────────────────────────────────────────────────────────

    fn send_advertisement(&mut self) {
        let digest = self.root;
        let interest = Interest::new(SyncName::Advertise(digest).to_name(&self.prefix))
            .with_lifetime(self.config.advert_lifetime);
        trace!(digest = %digest, "advertising");

        let transport = Arc::clone(&self.transport);
        let events = self.events.clone();
        self.tasks.spawn(async move {
            let data = express(transport.as_ref(), interest).await;
            let _ = events.send(SyncEvent::AdvertReply { digest, data });
        });

        self.adverts_in_flight += 1;
        self.next_advert = Instant::now() + self.config.effective_sync_interval();
    }

    fn schedule_recovery(&mut self, digest: Digest) {
        if !self.recoveries.insert(digest) {
            return;
        }
        let delay = self.config.recovery_delay();
        debug!(digest = %digest, delay_ms = delay.as_millis() as u64, "scheduling recovery");

        let events = self.events.clone();
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SyncEvent::RecoverDue(digest));
        });
    }

    async fn send_recovery(&mut self, digest: Digest) -> Result<()> {
        if digest == self.root || self.log.is_known_digest(&digest).await? {
            debug!(digest = %digest, "digest became known, skipping recovery");
            self.recoveries.remove(&digest);
            return Ok(());
        }

        info!(digest = %digest, "requesting recovery");
        let interest = Interest::new(SyncName::Recover(digest).to_name(&self.prefix))
            .with_lifetime(self.config.recovery_lifetime);
        let transport = Arc::clone(&self.transport);
        let events = self.events.clone();
        self.tasks.spawn(async move {
            let data = express(transport.as_ref(), interest).await;
            let _ = events.send(SyncEvent::RecoverReply { digest, data });
        });
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Replies
    // ─────────────────────────────────────────────────────────────────────────

    async fn handle_event(&mut self, event: SyncEvent) {
        let result = match event {
            SyncEvent::AdvertReply { digest, data } => {
                self.adverts_in_flight = self.adverts_in_flight.saturating_sub(1);
                match data {
                    Some(data) => self.handle_state_data(data).await,
                    None => {
                        trace!(digest = %digest, "advertisement timed out");
                        Ok(())
                    }
                }
            }
            SyncEvent::RecoverDue(digest) => self.send_recovery(digest).await,
            SyncEvent::RecoverReply { digest, data } => {
                self.recoveries.remove(&digest);
                match data {
                    Some(data) => self.handle_state_data(data).await,
                    None => {
                        debug!(digest = %digest, "recovery timed out");
                        Ok(())
                    }
                }
            }
        };
        if let Err(e) = result {
            error!(error = %e, "failed to process sync event");
        }
    }

    async fn handle_state_data(&mut self, data: Data) -> Result<()> {
        let msg = match SyncStateMsg::decode(&data.content) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(name = %data.name, error = %e, "dropping malformed sync reply");
                return Ok(());
            }
        };

        // Deletes are never applied: sequences only move forward.
        for record in msg.states.iter().filter(|r| r.is_update()) {
            self.log.update_device_seq(&record.device, record.seq).await?;
            if let Some(locator) = &record.locator {
                self.log.update_locator(&record.device, locator).await?;
            }
        }

        let old = self.root;
        let new = self.log.remember_state().await?;
        if new == old {
            trace!(digest = %old, "reply brought nothing new");
            return Ok(());
        }

        let delta = self.log.find_differences(&old, &new, true).await?;
        self.set_root(new);
        debug!(old = %old, new = %new, records = delta.len(), "merged sync reply");
        if !delta.is_empty() {
            (self.callback)(delta);
        }
        self.send_advertisement();
        Ok(())
    }
}

async fn express<T: Transport + ?Sized>(transport: &T, interest: Interest) -> Option<Data> {
    match transport.express_interest(interest).await {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, "interest failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{FaceId, MemoryNetwork, MemoryTransport};
    use driftsync_core::StateSnapshot;
    use driftsync_store::MemoryStore;
    use bytes::Bytes;
    use std::sync::Mutex;

    type Deltas = Arc<Mutex<Vec<DeltaRecord>>>;

    fn device(name: &str) -> DeviceId {
        name.parse().unwrap()
    }

    fn prefix() -> Name {
        SyncConfig::default().sync_prefix
    }

    async fn start(
        network: &Arc<MemoryNetwork>,
        name: &str,
    ) -> (SyncCore, Arc<MemoryStore>, FaceId, Deltas) {
        let transport = network.create_transport().await;
        let face = transport.face();
        let store = Arc::new(MemoryStore::new());
        let deltas: Deltas = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&deltas);
        let core = SyncCore::spawn(
            Arc::clone(&store),
            Arc::new(transport),
            device(name),
            SyncConfig::default(),
            Arc::new(move |records: Vec<DeltaRecord>| sink.lock().unwrap().extend(records)),
        )
        .await
        .unwrap();
        (core, store, face, deltas)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        check()
    }

    fn state_of(entries: &[(&str, u64)]) -> StateSnapshot {
        StateSnapshot::from_entries(entries.iter().map(|(d, s)| (device(d), *s)))
    }

    fn full_state_msg(entries: &[(&str, u64)]) -> Bytes {
        let records = entries
            .iter()
            .map(|(d, s)| DeltaRecord::update(device(d), *s))
            .collect();
        SyncStateMsg::new(records).encode().unwrap()
    }

    fn spawn_advert(peer: &Arc<MemoryTransport>, digest: Digest) {
        let peer = Arc::clone(peer);
        let interest = Interest::new(SyncName::Advertise(digest).to_name(&prefix()))
            .with_lifetime(Duration::from_secs(1));
        tokio::spawn(async move { peer.express_interest(interest).await });
    }

    async fn recovery_count(network: &MemoryNetwork, face: FaceId, digest: Digest) -> usize {
        let recover = SyncName::Recover(digest).to_name(&prefix());
        network
            .interest_log()
            .await
            .into_iter()
            .filter(|(f, name)| *f == face && *name == recover)
            .count()
    }

    #[test]
    fn test_sync_interval_is_clamped() {
        let config = SyncConfig::default().with_sync_interval(Duration::from_secs(120));
        assert_eq!(config.effective_sync_interval(), MAX_SYNC_INTERVAL);
        assert_eq!(
            SyncConfig::default().effective_sync_interval(),
            Duration::from_secs(4)
        );
    }

    #[test]
    fn test_recovery_delay_within_jitter() {
        let config = SyncConfig::default();
        for _ in 0..100 {
            let delay = config.recovery_delay();
            assert!(delay >= Duration::from_millis(37));
            assert!(delay <= Duration::from_millis(63));
        }
        let fixed = SyncConfig::default().with_recover_wait(Duration::from_millis(10), 0);
        assert_eq!(fixed.recovery_delay(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_nodes_converge() {
        let network = MemoryNetwork::new();
        let (alice, _, _, _) = start(&network, "/alice").await;
        let (bob, bob_store, _, bob_deltas) = start(&network, "/bob").await;
        settle().await;

        alice.publish_local_seq(3).await.unwrap();
        assert!(eventually(|| bob.root_digest() == alice.root_digest()).await);
        assert_eq!(
            bob_store.device_seq(&device("/alice")).await.unwrap(),
            Some(3)
        );
        assert_eq!(
            bob_deltas.lock().unwrap().clone(),
            vec![DeltaRecord::update(device("/alice"), 3).with_old_seq(0)]
        );

        bob.publish_local_seq(5).await.unwrap();
        assert!(eventually(|| bob.root_digest() == alice.root_digest()).await);
        assert_eq!(
            alice.root_digest(),
            state_of(&[("/alice", 3), ("/bob", 5)]).digest()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_known_digest_gets_delta_reply() {
        let network = MemoryNetwork::new();
        let (alice, _, _, _) = start(&network, "/alice").await;
        alice.publish_local_seq(2).await.unwrap();

        let peer = network.create_transport().await;
        let data = peer
            .express_interest(Interest::new(
                SyncName::Advertise(Digest::origin()).to_name(&prefix()),
            ))
            .await
            .unwrap()
            .expect("reply");
        let msg = SyncStateMsg::decode(&data.content).unwrap();
        assert_eq!(msg.states, vec![DeltaRecord::update(device("/alice"), 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_digest_sends_one_recovery() {
        let network = MemoryNetwork::new();
        let (bob, _, bob_face, _) = start(&network, "/bob").await;
        let peer = Arc::new(network.create_transport().await);
        let unknown = state_of(&[("/x", 5)]).digest();

        spawn_advert(&peer, unknown);
        spawn_advert(&peer, unknown);
        settle().await;
        assert_eq!(bob.phase(), SyncPhase::RecoveryPending);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(recovery_count(&network, bob_face, unknown).await, 1);
        assert_eq!(bob.root_digest(), Digest::origin());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_before_recovery_cancels_it() {
        let network = MemoryNetwork::new();
        let (bob, _, bob_face, _) = start(&network, "/bob").await;
        let peer = Arc::new(network.create_transport().await);
        let target = state_of(&[("/x", 5)]).digest();
        settle().await;

        spawn_advert(&peer, target);
        settle().await;

        // Satisfies bob's outstanding advertisement of the origin digest.
        peer.put_data(Data::new(
            SyncName::Advertise(Digest::origin()).to_name(&prefix()),
            full_state_msg(&[("/x", 5)]),
        ))
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(bob.root_digest(), target);
        assert_eq!(recovery_count(&network, bob_face, target).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_catches_up() {
        let network = MemoryNetwork::new();
        let peer = Arc::new(network.create_transport().await);
        let mut peer_interests = peer.register_prefix(&prefix()).await.unwrap();
        let target = state_of(&[("/x", 5), ("/y", 2)]).digest();

        let responder = Arc::clone(&peer);
        tokio::spawn(async move {
            while let Some(interest) = peer_interests.recv().await {
                if let Ok(SyncName::Recover(_)) = SyncName::parse(&prefix(), &interest.name) {
                    let content = full_state_msg(&[("/x", 5), ("/y", 2)]);
                    let _ = responder.put_data(Data::new(interest.name, content)).await;
                }
            }
        });

        let (bob, bob_store, _, bob_deltas) = start(&network, "/bob").await;
        spawn_advert(&peer, target);

        assert!(eventually(|| bob.root_digest() == target).await);
        assert_eq!(bob_store.device_seq(&device("/y")).await.unwrap(), Some(2));
        assert_eq!(bob_deltas.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_reply_is_dropped() {
        let network = MemoryNetwork::new();
        let peer = Arc::new(network.create_transport().await);
        let mut peer_interests = peer.register_prefix(&prefix()).await.unwrap();

        let responder = Arc::clone(&peer);
        tokio::spawn(async move {
            while let Some(interest) = peer_interests.recv().await {
                let _ = responder
                    .put_data(Data::new(interest.name, Bytes::from_static(b"\xff\x00garbage")))
                    .await;
            }
        });

        let (bob, bob_store, _, bob_deltas) = start(&network, "/bob").await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(bob.root_digest(), Digest::origin());
        assert!(bob_store.current_state().await.unwrap().is_empty());
        assert!(bob_deltas.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_the_loop() {
        let network = MemoryNetwork::new();
        let (alice, _, _, _) = start(&network, "/alice").await;

        alice.shutdown().await;
        assert_eq!(alice.phase(), SyncPhase::Idle);
        assert!(matches!(
            alice.local_state_changed().await,
            Err(SyncError::Stopped)
        ));
        // A second shutdown is harmless.
        alice.shutdown().await;
    }
}
