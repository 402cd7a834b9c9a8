//! State digests.
//!
//! A digest is the content address of one exact global sequence state. It
//! travels as the final component of sync names and is compared byte-for-byte.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use bytes::Bytes;

use crate::error::CoreError;
use crate::state::StateSnapshot;

/// Length of a digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// A 32-byte BLAKE3 digest of a [`StateSnapshot`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    /// Hash arbitrary bytes.
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// The digest of the empty state.
    ///
    /// Every device starts here, so two fresh devices always agree.
    pub fn origin() -> Self {
        static ORIGIN: OnceLock<Digest> = OnceLock::new();
        *ORIGIN.get_or_init(|| StateSnapshot::new().digest())
    }

    /// Whether this is the origin digest.
    pub fn is_origin(&self) -> bool {
        *self == Self::origin()
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// The digest as a name component.
    pub fn to_component(&self) -> Bytes {
        Bytes::copy_from_slice(&self.0)
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(s)?;
        Self::try_from(bytes.as_slice())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; DIGEST_LEN]> for Digest {
    fn from(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for Digest {
    type Error = CoreError;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; DIGEST_LEN] = slice
            .try_into()
            .map_err(|_| CoreError::InvalidDigestLength(slice.len()))?;
        Ok(Self(arr))
    }
}
