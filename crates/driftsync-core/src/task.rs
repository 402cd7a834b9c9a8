//! Fetch task descriptions.
//!
//! A fetch task names an inclusive range of one producer's segments under a
//! base name. Tasks are persisted so that outstanding fetches survive restarts.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::name::{DeviceId, Name};

/// Coarse two-level scheduling priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Appended to the back of the worklist.
    #[default]
    Normal,
    /// Inserted at the front of the worklist.
    High,
}

impl Priority {
    /// Stable numeric encoding for storage.
    pub fn as_u8(self) -> u8 {
        match self {
            Priority::Normal => 0,
            Priority::High => 1,
        }
    }

    /// Decode the storage encoding.
    pub fn from_u8(value: u8) -> Result<Self, CoreError> {
        match value {
            0 => Ok(Priority::Normal),
            1 => Ok(Priority::High),
            other => Err(CoreError::InvalidPriority(other)),
        }
    }
}

/// Persistence key of a fetch task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub producer: DeviceId,
    pub base_name: Name,
}

/// A request for segments `[min_seq, max_seq]` of `producer`'s `base_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchTask {
    pub producer: DeviceId,
    pub base_name: Name,
    pub min_seq: u64,
    pub max_seq: u64,
    pub priority: Priority,
}

impl FetchTask {
    pub fn new(
        producer: DeviceId,
        base_name: Name,
        min_seq: u64,
        max_seq: u64,
        priority: Priority,
    ) -> Self {
        Self {
            producer,
            base_name,
            min_seq,
            max_seq,
            priority,
        }
    }

    /// The persistence key.
    pub fn key(&self) -> TaskKey {
        TaskKey {
            producer: self.producer.clone(),
            base_name: self.base_name.clone(),
        }
    }

    /// Whether the range is empty (`min_seq > max_seq`).
    pub fn is_empty(&self) -> bool {
        self.min_seq > self.max_seq
    }

    /// Number of segments in the range.
    pub fn segment_count(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.max_seq - self.min_seq + 1
        }
    }

    /// Whether `seq` lies in the range.
    pub fn contains(&self, seq: u64) -> bool {
        seq >= self.min_seq && seq <= self.max_seq
    }

    /// Grow the range to also span `other`'s range.
    ///
    /// The priority becomes the higher of the two. Returns true if anything
    /// changed.
    pub fn widen(&mut self, other: &FetchTask) -> bool {
        let before = (self.min_seq, self.max_seq, self.priority);
        self.min_seq = self.min_seq.min(other.min_seq);
        self.max_seq = self.max_seq.max(other.max_seq);
        if other.priority == Priority::High {
            self.priority = Priority::High;
        }
        before != (self.min_seq, self.max_seq, self.priority)
    }
}
