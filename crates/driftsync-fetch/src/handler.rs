//! Collaborator seams of the fetch pipeline: where bytes go, and how a
//! producer's routable prefix is found.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;

use driftsync_core::{DeviceId, FetchTask, Name};

/// Receives the output of a fetch task.
///
/// Segments may arrive out of order. `on_finish` is called exactly once,
/// after every segment in the task's range has been delivered.
#[async_trait]
pub trait FetchHandler: Send + Sync {
    /// One segment arrived.
    async fn on_segment(&self, task: &FetchTask, seq: u64, content: Bytes);

    /// Every segment arrived.
    async fn on_finish(&self, task: &FetchTask);
}

/// Maps a producer to the prefix it can be reached under.
///
/// An empty name means the producer's names are routable as they are.
pub trait NameResolver: Send + Sync {
    fn resolve(&self, producer: &DeviceId) -> Name;
}

impl<F> NameResolver for F
where
    F: Fn(&DeviceId) -> Name + Send + Sync,
{
    fn resolve(&self, producer: &DeviceId) -> Name {
        self(producer)
    }
}

/// Resolver backed by a table of known locators.
#[derive(Debug, Default)]
pub struct LocatorTable {
    locators: RwLock<HashMap<DeviceId, Name>>,
}

impl LocatorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `locator` for `producer`, replacing any previous one.
    pub fn insert(&self, producer: DeviceId, locator: Name) {
        let mut locators = self
            .locators
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        locators.insert(producer, locator);
    }

    pub fn get(&self, producer: &DeviceId) -> Option<Name> {
        self.locators
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(producer)
            .cloned()
    }
}

impl NameResolver for LocatorTable {
    fn resolve(&self, producer: &DeviceId) -> Name {
        self.get(producer).unwrap_or_default()
    }
}

/// Prefix reaching every device on the local broadcast domain.
pub fn broadcast_prefix() -> Name {
    Name::new().append("ndn").append("broadcast")
}

/// Where segment interests are sent.
#[derive(Clone, PartialEq, Eq)]
pub enum ForwardingHint {
    /// The broadcast prefix.
    Broadcast,
    /// A resolved prefix for the producer (possibly empty).
    Direct(Name),
}

impl ForwardingHint {
    /// The prefix prepended to segment names.
    pub fn prefix(&self) -> Name {
        match self {
            ForwardingHint::Broadcast => broadcast_prefix(),
            ForwardingHint::Direct(name) => name.clone(),
        }
    }

    /// The hint to use after a failed attempt.
    pub fn alternate(&self, resolver: &dyn NameResolver, producer: &DeviceId) -> Self {
        match self {
            ForwardingHint::Broadcast => ForwardingHint::Direct(resolver.resolve(producer)),
            ForwardingHint::Direct(_) => ForwardingHint::Broadcast,
        }
    }

    /// Name of segment `seq` of `base` under this hint.
    pub fn segment_name(&self, base: &Name, seq: u64) -> Name {
        self.prefix().append_name(base).append_number(seq)
    }
}

impl fmt::Debug for ForwardingHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardingHint::Broadcast => write!(f, "Broadcast"),
            ForwardingHint::Direct(name) => write!(f, "Direct({})", name),
        }
    }
}
