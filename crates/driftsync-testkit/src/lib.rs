//! # DriftSync Testkit
//!
//! Testing utilities for DriftSync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: in-memory action logs and nodes wired to a shared
//!   [`MemoryNetwork`](driftsync_sync::MemoryNetwork)
//! - **Generators**: Proptest strategies for names, sequence state and
//!   fetch tasks
//!
//! ## Test Fixtures
//!
//! ```rust,ignore
//! use driftsync_testkit::fixtures::{fast_config, multi_node_fixtures};
//!
//! let network = MemoryNetwork::new();
//! let nodes = multi_node_fixtures(&network, 3, fast_config()).await?;
//! nodes[0].append_and_publish("create notes.txt").await?;
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use driftsync_testkit::generators::snapshot;
//!
//! proptest! {
//!     #[test]
//!     fn digest_is_deterministic(state in snapshot()) {
//!         prop_assert_eq!(state.digest(), state.clone().digest());
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{
    all_converged, device, fast_config, init_tracing, multi_node_fixtures, random_device, wait_until,
    MemoryActionLog, TestNode,
};
pub use generators::{device_id, fetch_task, full_range_updates, name, snapshot, updates};
