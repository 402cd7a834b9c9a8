//! # DriftSync Fetch
//!
//! Reliable, pipelined retrieval of numbered segments over a transport that
//! only offers single-shot interests with timeouts.
//!
//! ## Overview
//!
//! A [`FetchTask`](driftsync_core::FetchTask) asks for segments
//! `[min_seq, max_seq]` of a producer's object. The [`FetchManager`] keeps a
//! worklist of [`Fetcher`]s and runs at most `max_parallel_fetches` of them
//! at once. Each running fetcher keeps up to `pipeline_width` segment
//! interests outstanding.
//!
//! ## Timeouts
//!
//! - A segment that times out while other segments recently arrived is a
//!   gap: it is requested again in the same attempt.
//! - A segment that times out with no recent arrivals fails the attempt. The
//!   fetcher switches between the broadcast and the direct forwarding hint
//!   and backs off exponentially (1s, 2s, 4s, ... up to `max_retry_pause`).
//!
//! ## Persistence
//!
//! Tasks are written to a [`TaskStore`](driftsync_store::TaskStore) when
//! enqueued and deleted when they finish or are cancelled, so
//! [`FetchManager::restore`] can pick them up after a restart.

pub mod error;
pub mod fetcher;
pub mod handler;
pub mod manager;

pub use error::{FetchError, Result};
pub use fetcher::{Attempt, Fetcher, Progress, RetryPause, MIN_RETRY_PAUSE};
pub use handler::{broadcast_prefix, FetchHandler, ForwardingHint, LocatorTable, NameResolver};
pub use manager::{FetchConfig, FetchManager, FetcherId, FetcherState};
