//! # DriftSync Core
//!
//! Pure primitives for DriftSync: hierarchical names, device sequence state,
//! state digests, deltas between digests, and fetch task descriptions.
//!
//! This crate contains no I/O, no storage, no networking. It is pure computation
//! over the data model that the store, sync and fetch crates share.
//!
//! ## Key Types
//!
//! - [`Name`] - Ordered sequence of opaque byte components
//! - [`DeviceId`] - Globally unique device identity (a namespace name)
//! - [`StateSnapshot`] - Device → highest known sequence number
//! - [`Digest`] - Order-independent summary of a snapshot
//! - [`DeltaRecord`] - One per-device difference between two snapshots
//! - [`FetchTask`] - A request for an inclusive range of a producer's segments
//!
//! ## Digests
//!
//! Two devices holding the same [`StateSnapshot`] always compute the same
//! [`Digest`]. The digest of the empty snapshot is [`Digest::origin`].

pub mod digest;
pub mod error;
pub mod name;
pub mod state;
pub mod task;

pub use digest::Digest;
pub use error::{CoreError, Result};
pub use name::{DeviceId, Name};
pub use state::{DeltaKind, DeltaRecord, StateSnapshot};
pub use task::{FetchTask, Priority, TaskKey};
