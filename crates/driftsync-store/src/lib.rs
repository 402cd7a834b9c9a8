//! # DriftSync Store
//!
//! Persistence for DriftSync: the state digest log and the fetch task store.
//! Both are trait-based with SQLite and in-memory implementations.
//!
//! ## Overview
//!
//! The [`DigestLog`] trait holds the device sequence table and records every
//! computed digest together with the snapshot it summarizes, so that the
//! difference between any two previously seen digests can be answered later.
//! The [`TaskStore`] trait keeps outstanding fetch tasks across restarts.
//!
//! ## Key Types
//!
//! - [`DigestLog`] - Device sequences, digest recording, differencing
//! - [`TaskStore`] - Persisted fetch tasks keyed by (producer, base name)
//! - [`SqliteStore`] - SQLite-based persistent storage (implements both)
//! - [`MemoryStore`] - In-memory storage for tests (implements both)
//!
//! ## Usage
//!
//! ```rust,no_run
//! use driftsync_store::{DigestLog, SqliteStore};
//!
//! async fn example() {
//!     let store = SqliteStore::open("driftsync.db").unwrap();
//!
//!     let device = "/alice/laptop".parse().unwrap();
//!     store.update_device_seq(&device, 1).await.unwrap();
//!     let digest = store.remember_state().await.unwrap();
//!     println!("now at {}", digest);
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Monotonic sequences**: `update_device_seq` keeps `max(existing, new)`
//! - **Transactional recording**: a digest and its snapshot rows commit together
//! - **Origin is always known**: the empty-state digest needs no recording

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{DigestLog, TaskStore};
