//! # DriftSync Sync
//!
//! Digest-based state synchronization between devices.
//!
//! ## Overview
//!
//! Every device periodically advertises the digest of its device sequence
//! state as an interest under a shared broadcast prefix. A peer that has
//! recorded that digest answers with the per-device delta; a peer that has
//! never seen it waits a short randomized interval and then asks for a full
//! catch-up (recovery), unless the digest became known in the meantime.
//!
//! ## Key Properties
//!
//! - **Idempotent**: merging the same reply twice changes nothing
//! - **Commutative**: replies may arrive in any order
//! - **Monotonic**: sequence numbers never decrease
//! - **Cheap when in sync**: an equal digest needs no reply at all
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use driftsync_core::DeltaRecord;
//! use driftsync_store::MemoryStore;
//! use driftsync_sync::{MemoryNetwork, SyncConfig, SyncCore};
//!
//! async fn example() {
//!     let network = MemoryNetwork::new();
//!     let transport = Arc::new(network.create_transport().await);
//!     let store = Arc::new(MemoryStore::new());
//!
//!     let core = SyncCore::spawn(
//!         store,
//!         transport,
//!         "/alice/laptop".parse().unwrap(),
//!         SyncConfig::default(),
//!         Arc::new(|delta: Vec<DeltaRecord>| println!("{} devices changed", delta.len())),
//!     )
//!     .await
//!     .unwrap();
//!
//!     core.publish_local_seq(1).await.unwrap();
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Device A                                   Device B
//!   |---- interest <prefix>/<digest A> -------->|   B knows digest A
//!   |<--- data: delta(A -> B) ------------------|
//!   |                                           |
//!   |---- interest <prefix>/<digest X> -------->|   B does not know X
//!   |                      (wait recover_wait ± jitter)
//!   |<--- interest <prefix>/RECOVER/<X> --------|
//!   |---- data: full state -------------------->|
//! ```

pub mod convergence;
pub mod error;
pub mod messages;
pub mod protocol;
pub mod transport;

pub use convergence::{compare_snapshots, verify_convergence, ConvergenceResult};
pub use error::{Result, SyncError};
pub use messages::{limits, SyncName, SyncStateMsg, PROTOCOL_VERSION};
pub use protocol::{StateChangeCallback, SyncConfig, SyncCore, SyncPhase, MAX_SYNC_INTERVAL};
pub use transport::{
    memory::MemoryNetwork, memory::MemoryTransport, Data, Interest, InterestReceiver, Transport,
};
