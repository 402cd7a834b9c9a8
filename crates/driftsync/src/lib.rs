//! # DriftSync
//!
//! Decentralized, eventually-consistent action-log synchronization over a
//! named-data transport.
//!
//! ## Overview
//!
//! Every device keeps an append-only action log. DriftSync makes all devices
//! converge on the same logs without a coordinator:
//!
//! - **Sync** ([`sync`]): devices advertise a digest of their per-device
//!   sequence state and answer each other with the differences.
//! - **Fetch** ([`fetch`]): missing sequence ranges are retrieved as
//!   pipelined segment interests with backoff and forwarding-hint fallback.
//! - **Node** ([`Node`]): wires the two together, serves the local log to
//!   peers and restores unfinished fetches after a restart.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use driftsync::{Node, NodeConfig};
//! use driftsync::store::SqliteStore;
//!
//! let store = Arc::new(SqliteStore::open("driftsync.db")?);
//! let node = Node::start(
//!     "/home/alice".parse()?,
//!     store,
//!     transport,
//!     action_log.clone(), // ActionSource
//!     action_log,         // ActionSink
//!     NodeConfig::default(),
//! )
//! .await?;
//!
//! // After appending record 1 to the local log:
//! node.publish(1).await?;
//! ```
//!
//! ## Crate Structure
//!
//! - `driftsync-core`: names, digests, sequence state, fetch tasks
//! - `driftsync-store`: digest log and task persistence (memory, SQLite)
//! - `driftsync-sync`: transport seam and the state sync protocol
//! - `driftsync-fetch`: fetch pipeline and scheduler
//! - `driftsync`: this crate, the node tying them together

pub mod error;
pub mod node;

// Re-export component crates
pub use driftsync_core as core;
pub use driftsync_fetch as fetch;
pub use driftsync_store as store;
pub use driftsync_sync as sync;

// Re-export main types
pub use error::{NodeError, Result};
pub use node::{ActionSink, ActionSource, Node, NodeConfig, DEFAULT_SEGMENT_FRESHNESS};

pub use driftsync_core::{DeltaRecord, DeviceId, Digest, FetchTask, Name, Priority, StateSnapshot};
pub use driftsync_fetch::{FetchConfig, FetchManager};
pub use driftsync_store::{DigestLog, MemoryStore, SqliteStore, TaskStore};
pub use driftsync_sync::{MemoryNetwork, SyncConfig, SyncCore, Transport};
