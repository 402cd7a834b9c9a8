//! Sync protocol names and message types.
//!
//! Advertisements are interests named `<sync-prefix>/<digest>`; recovery
//! requests are `<sync-prefix>/RECOVER/<digest>`. Replies to either carry a
//! CBOR-encoded [`SyncStateMsg`] under the same name.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use driftsync_core::{DeltaRecord, Digest, Name};

use crate::error::{Result, SyncError};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 0;

/// Name component marking a recovery request.
pub const RECOVER_COMPONENT: &[u8] = b"RECOVER";

/// Message size limits.
pub mod limits {
    /// Max delta records in one state message.
    pub const MAX_STATES_PER_MESSAGE: usize = 10_000;
}

/// A parsed sync-protocol name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncName {
    /// Periodic advertisement of the sender's digest.
    Advertise(Digest),
    /// Request for a full catch-up from anyone who knows the digest.
    Recover(Digest),
}

impl SyncName {
    /// The digest carried by the name.
    pub fn digest(&self) -> Digest {
        match self {
            SyncName::Advertise(d) | SyncName::Recover(d) => *d,
        }
    }

    /// Build the full name under `prefix`.
    pub fn to_name(&self, prefix: &Name) -> Name {
        match self {
            SyncName::Advertise(d) => prefix.clone().append(d.to_component()),
            SyncName::Recover(d) => prefix
                .clone()
                .append(Bytes::from_static(RECOVER_COMPONENT))
                .append(d.to_component()),
        }
    }

    /// Parse `name`, which must lie under `prefix`.
    pub fn parse(prefix: &Name, name: &Name) -> Result<Self> {
        let rest = name
            .strip_prefix(prefix)
            .ok_or_else(|| SyncError::UnexpectedName(name.to_string()))?;

        let digest_of = |component: &Bytes| {
            Digest::try_from(&component[..])
                .map_err(|e| SyncError::UnexpectedName(format!("{}: {}", name, e)))
        };

        match rest.components() {
            [digest] => Ok(SyncName::Advertise(digest_of(digest)?)),
            [marker, digest] if &marker[..] == RECOVER_COMPONENT => {
                Ok(SyncName::Recover(digest_of(digest)?))
            }
            _ => Err(SyncError::UnexpectedName(name.to_string())),
        }
    }
}

/// Payload of advertisement and recovery replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStateMsg {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// Per-device records the receiver should merge.
    pub states: Vec<DeltaRecord>,
}

impl SyncStateMsg {
    pub fn new(states: Vec<DeltaRecord>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            states,
        }
    }

    /// Encode as CBOR.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| SyncError::Encoding(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    /// Decode from CBOR, checking version and limits.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let msg: SyncStateMsg =
            ciborium::from_reader(bytes).map_err(|e| SyncError::InvalidMessage(e.to_string()))?;
        if msg.version != PROTOCOL_VERSION {
            return Err(SyncError::InvalidMessage(format!(
                "unsupported version {}",
                msg.version
            )));
        }
        msg.validate_limits()?;
        Ok(msg)
    }

    /// Check if this message respects size limits.
    pub fn validate_limits(&self) -> Result<()> {
        if self.states.len() > limits::MAX_STATES_PER_MESSAGE {
            return Err(SyncError::InvalidMessage(format!(
                "too many states: {}",
                self.states.len()
            )));
        }
        Ok(())
    }
}
