//! Named-data transport abstraction.
//!
//! The transport routes named interests to whoever registered a matching
//! prefix and delivers at most one data reply per interest. Timeouts are
//! explicit: an interest that expires yields `Ok(None)`, never an error.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use driftsync_core::Name;

use crate::error::SyncError;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Default lifetime of an interest.
pub const DEFAULT_INTEREST_LIFETIME: Duration = Duration::from_secs(4);

/// A request for data under a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interest {
    /// Data whose name has this as a prefix satisfies the interest.
    pub name: Name,
    /// How long to wait for data before reporting a timeout.
    pub lifetime: Duration,
}

impl Interest {
    pub fn new(name: Name) -> Self {
        Self {
            name,
            lifetime: DEFAULT_INTEREST_LIFETIME,
        }
    }

    /// Set the lifetime.
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }
}

/// A named piece of content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub name: Name,
    pub content: Bytes,
    /// How long caches may serve this data to later interests.
    pub freshness: Duration,
}

impl Data {
    pub fn new(name: Name, content: impl Into<Bytes>) -> Self {
        Self {
            name,
            content: content.into(),
            freshness: Duration::ZERO,
        }
    }

    /// Set the freshness period.
    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }
}

/// Stream of interests matching a registered prefix.
pub type InterestReceiver = mpsc::Receiver<Interest>;

/// Transport trait for the named-data substrate.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send an interest and wait for the single reply.
    ///
    /// Returns `None` if the lifetime expires first.
    async fn express_interest(&self, interest: Interest) -> Result<Option<Data>>;

    /// Publish data, satisfying pending interests it matches.
    async fn put_data(&self, data: Data) -> Result<()>;

    /// Start receiving interests under `prefix`.
    async fn register_prefix(&self, prefix: &Name) -> Result<InterestReceiver>;

    /// Stop receiving interests under `prefix`.
    ///
    /// Returns false if the prefix was not registered by this transport.
    async fn unregister_prefix(&self, prefix: &Name) -> bool;
}

/// A simple in-memory named-data network for testing.
///
/// Every transport created from a [`MemoryNetwork`] is one face. Interests
/// are forwarded to every other face with a matching registered prefix;
/// data satisfies pending interests and is cached for its freshness period.
pub mod memory {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::{oneshot, Mutex};
    use tokio::time::Instant;

    /// Identifier of a face on the memory network.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct FaceId(pub u64);

    struct Filter {
        face: FaceId,
        prefix: Name,
        sender: mpsc::Sender<Interest>,
    }

    struct PendingInterest {
        id: u64,
        face: FaceId,
        name: Name,
        reply: oneshot::Sender<Data>,
    }

    struct CachedData {
        producer: FaceId,
        data: Data,
        expires: Instant,
    }

    #[derive(Default)]
    struct NetworkState {
        next_face: u64,
        next_pending: u64,
        filters: Vec<Filter>,
        pending: Vec<PendingInterest>,
        cache: Vec<CachedData>,
        offline: Vec<FaceId>,
        interest_log: Vec<(FaceId, Name)>,
    }

    impl NetworkState {
        fn is_online(&self, face: FaceId) -> bool {
            !self.offline.contains(&face)
        }
    }

    /// Shared state for the memory transport network.
    pub struct MemoryNetwork {
        state: Mutex<NetworkState>,
    }

    impl MemoryNetwork {
        /// Create a new memory network.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Create a transport (face) connected to this network.
        pub async fn create_transport(self: &Arc<Self>) -> MemoryTransport {
            let mut state = self.state.lock().await;
            let face = FaceId(state.next_face);
            state.next_face += 1;

            MemoryTransport {
                face,
                network: Arc::clone(self),
            }
        }

        /// Take a face off the network or bring it back.
        ///
        /// An offline face neither sends nor receives anything.
        pub async fn set_online(&self, face: FaceId, online: bool) {
            let mut state = self.state.lock().await;
            state.offline.retain(|f| *f != face);
            if !online {
                state.offline.push(face);
            }
        }

        /// Every interest expressed so far, in order.
        pub async fn interest_log(&self) -> Vec<(FaceId, Name)> {
            self.state.lock().await.interest_log.clone()
        }
    }

    impl Default for MemoryNetwork {
        fn default() -> Self {
            Self {
                state: Mutex::new(NetworkState::default()),
            }
        }
    }

    /// In-memory transport implementation.
    pub struct MemoryTransport {
        face: FaceId,
        network: Arc<MemoryNetwork>,
    }

    impl MemoryTransport {
        /// This transport's face.
        pub fn face(&self) -> FaceId {
            self.face
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn express_interest(&self, interest: Interest) -> Result<Option<Data>> {
            let (tx, rx) = oneshot::channel();
            let pending_id;
            let targets: Vec<mpsc::Sender<Interest>>;
            {
                let mut state = self.network.state.lock().await;
                state.interest_log.push((self.face, interest.name.clone()));

                if !state.is_online(self.face) {
                    drop(state);
                    tokio::time::sleep(interest.lifetime).await;
                    return Ok(None);
                }

                let now = Instant::now();
                state.cache.retain(|c| c.expires > now);
                if let Some(cached) = state.cache.iter().find(|c| {
                    c.producer != self.face && interest.name.is_prefix_of(&c.data.name)
                }) {
                    return Ok(Some(cached.data.clone()));
                }

                pending_id = state.next_pending;
                state.next_pending += 1;
                state.pending.push(PendingInterest {
                    id: pending_id,
                    face: self.face,
                    name: interest.name.clone(),
                    reply: tx,
                });

                targets = state
                    .filters
                    .iter()
                    .filter(|f| f.face != self.face && f.prefix.is_prefix_of(&interest.name))
                    .filter(|f| !state.offline.contains(&f.face))
                    .map(|f| f.sender.clone())
                    .collect();
            }

            for target in targets {
                // A full or closed filter behaves like a lossy link.
                let _ = target.try_send(interest.clone());
            }

            match tokio::time::timeout(interest.lifetime, rx).await {
                Ok(Ok(data)) => Ok(Some(data)),
                Ok(Err(_)) | Err(_) => {
                    let mut state = self.network.state.lock().await;
                    state.pending.retain(|p| p.id != pending_id);
                    Ok(None)
                }
            }
        }

        async fn put_data(&self, data: Data) -> Result<()> {
            let mut state = self.network.state.lock().await;
            if !state.is_online(self.face) {
                return Ok(());
            }

            if !data.freshness.is_zero() {
                state.cache.push(CachedData {
                    producer: self.face,
                    data: data.clone(),
                    expires: Instant::now() + data.freshness,
                });
            }

            let face = self.face;
            let (matched, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
                .into_iter()
                .partition(|p| p.face != face && p.name.is_prefix_of(&data.name));
            state.pending = rest;

            let mut delivered = Vec::new();
            for pending in matched {
                if state.is_online(pending.face) {
                    delivered.push(pending.reply);
                } else {
                    state.pending.push(pending);
                }
            }
            drop(state);

            for reply in delivered {
                let _ = reply.send(data.clone());
            }
            Ok(())
        }

        async fn register_prefix(&self, prefix: &Name) -> Result<InterestReceiver> {
            let (tx, rx) = mpsc::channel(1024);
            let mut state = self.network.state.lock().await;
            state.filters.push(Filter {
                face: self.face,
                prefix: prefix.clone(),
                sender: tx,
            });
            Ok(rx)
        }

        async fn unregister_prefix(&self, prefix: &Name) -> bool {
            let mut state = self.network.state.lock().await;
            let before = state.filters.len();
            state
                .filters
                .retain(|f| !(f.face == self.face && &f.prefix == prefix));
            state.filters.len() != before
        }
    }
}
