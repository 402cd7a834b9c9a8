//! Hierarchical names.
//!
//! A [`Name`] is an ordered list of opaque byte components. Routing, request
//! filtering and device identity are all expressed in terms of names and the
//! prefix relation between them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// An ordered sequence of opaque byte-string components.
///
/// The textual form is `/a/b/c`. Bytes outside the unreserved ASCII set are
/// written as `%XX` escapes.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Name(Vec<Bytes>);

impl Name {
    /// The empty name.
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a name from its components.
    pub fn from_components<I, C>(components: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Bytes>,
    {
        Self(components.into_iter().map(Into::into).collect())
    }

    /// Append one component, builder style.
    pub fn append(mut self, component: impl Into<Bytes>) -> Self {
        self.0.push(component.into());
        self
    }

    /// Append a number as an 8-byte big-endian component.
    pub fn append_number(self, value: u64) -> Self {
        self.append(Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    /// Append every component of `other`.
    pub fn append_name(mut self, other: &Name) -> Self {
        self.0.extend(other.0.iter().cloned());
        self
    }

    /// Push one component in place.
    pub fn push(&mut self, component: impl Into<Bytes>) {
        self.0.push(component.into());
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the name has no components.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All components in order.
    pub fn components(&self) -> &[Bytes] {
        &self.0
    }

    /// Component at `index`.
    pub fn get(&self, index: usize) -> Option<&Bytes> {
        self.0.get(index)
    }

    /// The final component.
    pub fn last(&self) -> Option<&Bytes> {
        self.0.last()
    }

    /// The first `len` components (the whole name if shorter).
    pub fn prefix(&self, len: usize) -> Name {
        Self(self.0.iter().take(len).cloned().collect())
    }

    /// Whether `self` is a prefix of (or equal to) `other`.
    pub fn is_prefix_of(&self, other: &Name) -> bool {
        self.0.len() <= other.0.len() && self.0.iter().zip(other.0.iter()).all(|(a, b)| a == b)
    }

    /// The remainder of `self` after `prefix`, if `prefix` matches.
    pub fn strip_prefix(&self, prefix: &Name) -> Option<Name> {
        if prefix.is_prefix_of(self) {
            Some(Self(self.0[prefix.len()..].to_vec()))
        } else {
            None
        }
    }

    /// Decode the component at `index` as a number written by [`Name::append_number`].
    pub fn number_at(&self, index: usize) -> Option<u64> {
        let component = self.0.get(index)?;
        let bytes: [u8; 8] = component.as_ref().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    /// Decode the final component as a number.
    pub fn last_number(&self) -> Option<u64> {
        self.0.len().checked_sub(1).and_then(|i| self.number_at(i))
    }
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~' | b'+' | b'=')
}

fn unescape(part: &str) -> Result<Vec<u8>, CoreError> {
    let bytes = part.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = part
                .get(i + 1..i + 3)
                .ok_or_else(|| CoreError::InvalidName(part.to_string()))?;
            let value = u8::from_str_radix(hex, 16)
                .map_err(|_| CoreError::InvalidName(part.to_string()))?;
            out.push(value);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

impl FromStr for Name {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.is_empty() && !s.starts_with('/') {
            return Err(CoreError::InvalidName(s.to_string()));
        }
        s.split('/')
            .filter(|part| !part.is_empty())
            .map(|part| unescape(part).map(Bytes::from))
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for component in &self.0 {
            f.write_str("/")?;
            for &b in component.iter() {
                if is_unreserved(b) {
                    write!(f, "{}", b as char)?;
                } else {
                    write!(f, "%{:02X}", b)?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({})", self)
    }
}

/// Identity of a participating device.
///
/// Identities are namespace names. They are globally unique and never reused
/// with a different meaning; routing hints live separately as locators.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(Name);

impl DeviceId {
    /// Wrap a name as a device identity.
    pub fn new(name: Name) -> Self {
        Self(name)
    }

    /// The underlying name.
    pub fn as_name(&self) -> &Name {
        &self.0
    }

    /// Consume into the underlying name.
    pub fn into_name(self) -> Name {
        self.0
    }
}

impl From<Name> for DeviceId {
    fn from(name: Name) -> Self {
        Self(name)
    }
}

impl FromStr for DeviceId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name: Name = s.parse()?;
        if name.is_empty() {
            return Err(CoreError::InvalidName("device identity cannot be empty".into()));
        }
        Ok(Self(name))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.0)
    }
}
