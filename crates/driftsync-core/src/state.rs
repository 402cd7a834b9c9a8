//! Device sequence state, snapshots and deltas.
//!
//! A [`StateSnapshot`] maps every known device to the highest sequence number
//! it is known to have produced. Snapshots only grow: merging keeps the larger
//! sequence, so merges are idempotent and order-insensitive.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::digest::Digest;
use crate::name::{DeviceId, Name};

/// Domain separator for state digests.
const STATE_DOMAIN: &[u8] = b"driftsync-state-v0:";

/// Per-device sequence numbers at one point in time.
///
/// Devices at sequence 0 carry no information and are never stored, so a
/// snapshot of freshly registered devices equals the empty snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    seqs: BTreeMap<DeviceId, u64>,
}

impl StateSnapshot {
    /// The empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(device, seq)` pairs, keeping the maximum per device.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (DeviceId, u64)>,
    {
        let mut snapshot = Self::new();
        for (device, seq) in entries {
            snapshot.merge(device, seq);
        }
        snapshot
    }

    /// Merge in a sequence number with `max(existing, seq)`.
    ///
    /// Returns true if the stored value changed.
    pub fn merge(&mut self, device: DeviceId, seq: u64) -> bool {
        if seq == 0 {
            return false;
        }
        match self.seqs.get_mut(&device) {
            Some(existing) if *existing >= seq => false,
            Some(existing) => {
                *existing = seq;
                true
            }
            None => {
                self.seqs.insert(device, seq);
                true
            }
        }
    }

    /// Sequence number recorded for `device`.
    pub fn get(&self, device: &DeviceId) -> Option<u64> {
        self.seqs.get(device).copied()
    }

    /// Number of devices with a non-zero sequence.
    pub fn len(&self) -> usize {
        self.seqs.len()
    }

    /// Whether no device has produced anything.
    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }

    /// Entries in canonical (device name) order.
    pub fn iter(&self) -> impl Iterator<Item = (&DeviceId, u64)> {
        self.seqs.iter().map(|(device, seq)| (device, *seq))
    }

    /// Compute the digest of this snapshot.
    ///
    /// Every device is hashed in sorted order as its length-prefixed name
    /// components followed by its big-endian sequence number.
    pub fn digest(&self) -> Digest {
        let mut hasher = blake3::Hasher::new();
        hasher.update(STATE_DOMAIN);
        for (device, seq) in &self.seqs {
            let components = device.as_name().components();
            hasher.update(&(components.len() as u32).to_be_bytes());
            for component in components {
                hasher.update(&(component.len() as u32).to_be_bytes());
                hasher.update(component);
            }
            hasher.update(&seq.to_be_bytes());
        }
        Digest(*hasher.finalize().as_bytes())
    }

    /// Records that turn `self` into `new`.
    ///
    /// Devices whose sequence differs (or that are new) become
    /// [`DeltaKind::Update`]; devices missing from `new` become
    /// [`DeltaKind::Delete`]. Output is sorted by device.
    pub fn diff(&self, new: &StateSnapshot, include_old_seq: bool) -> Vec<DeltaRecord> {
        let mut records = Vec::new();

        for (device, &seq) in &new.seqs {
            let old = self.seqs.get(device).copied();
            if old == Some(seq) {
                continue;
            }
            let mut record = DeltaRecord::update(device.clone(), seq);
            if include_old_seq {
                record.old_seq = Some(old.unwrap_or(0));
            }
            records.push(record);
        }

        for (device, &old) in &self.seqs {
            if new.seqs.contains_key(device) {
                continue;
            }
            let mut record = DeltaRecord::delete(device.clone());
            if include_old_seq {
                record.old_seq = Some(old);
            }
            records.push(record);
        }

        records.sort_by(|a, b| a.device.cmp(&b.device));
        records
    }

    /// Apply delta records literally: updates overwrite, deletes remove.
    ///
    /// Unlike [`StateSnapshot::merge`] this can lower or drop a sequence; it
    /// replays a delta computed by [`StateSnapshot::diff`].
    pub fn apply(&mut self, records: &[DeltaRecord]) {
        for record in records {
            match record.kind {
                DeltaKind::Update if record.seq > 0 => {
                    self.seqs.insert(record.device.clone(), record.seq);
                }
                DeltaKind::Update | DeltaKind::Delete => {
                    self.seqs.remove(&record.device);
                }
            }
        }
    }
}

/// Whether a device appears in or vanished from the newer snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeltaKind {
    /// The device has a (different) sequence in the newer snapshot.
    Update,
    /// The device is absent from the newer snapshot.
    Delete,
}

/// One per-device difference between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaRecord {
    /// The device this record describes.
    pub device: DeviceId,
    /// Update or delete.
    pub kind: DeltaKind,
    /// Sequence in the newer snapshot (0 for deletes).
    pub seq: u64,
    /// Sequence in the older snapshot, when requested (0 if absent there).
    pub old_seq: Option<u64>,
    /// Last known routing hint for the device.
    pub locator: Option<Name>,
}

impl DeltaRecord {
    /// An update record carrying the new sequence.
    pub fn update(device: DeviceId, seq: u64) -> Self {
        Self {
            device,
            kind: DeltaKind::Update,
            seq,
            old_seq: None,
            locator: None,
        }
    }

    /// A delete record.
    pub fn delete(device: DeviceId) -> Self {
        Self {
            device,
            kind: DeltaKind::Delete,
            seq: 0,
            old_seq: None,
            locator: None,
        }
    }

    /// Attach the old sequence number.
    pub fn with_old_seq(mut self, old_seq: u64) -> Self {
        self.old_seq = Some(old_seq);
        self
    }

    /// Attach a locator.
    pub fn with_locator(mut self, locator: Name) -> Self {
        self.locator = Some(locator);
        self
    }

    /// Whether this is an update.
    pub fn is_update(&self) -> bool {
        self.kind == DeltaKind::Update
    }

    /// The inclusive range of sequences that became available, if known.
    ///
    /// Only updates that move a device forward and carry an old sequence
    /// produce a range.
    pub fn missing_range(&self) -> Option<(u64, u64)> {
        match (self.kind, self.old_seq) {
            (DeltaKind::Update, Some(old)) if self.seq > old => Some((old + 1, self.seq)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn device(name: &str) -> DeviceId {
        name.parse().unwrap()
    }

    #[test]
    fn test_empty_snapshot_digest_is_origin() {
        let a = StateSnapshot::new();
        let b = StateSnapshot::from_entries([(device("/alice"), 0), (device("/bob"), 0)]);
        assert_eq!(a.digest(), Digest::origin());
        assert_eq!(b.digest(), Digest::origin());
    }

    #[test]
    fn test_merge_is_monotonic() {
        let mut snapshot = StateSnapshot::new();
        assert!(snapshot.merge(device("/alice"), 5));
        assert!(!snapshot.merge(device("/alice"), 3));
        assert!(!snapshot.merge(device("/alice"), 5));
        assert_eq!(snapshot.get(&device("/alice")), Some(5));
    }

    #[test]
    fn test_first_update_from_origin() {
        let new = StateSnapshot::from_entries([(device("/alice"), 1)]);
        let records = StateSnapshot::new().diff(&new, true);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, DeltaKind::Update);
        assert_eq!(records[0].seq, 1);
        assert_eq!(records[0].missing_range(), Some((1, 1)));
    }

    #[test]
    fn test_diff_emits_delete_for_dropped_device() {
        let old = StateSnapshot::from_entries([(device("/alice"), 2), (device("/bob"), 4)]);
        let new = StateSnapshot::from_entries([(device("/alice"), 3)]);
        let records = old.diff(&new, true);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], DeltaRecord::update(device("/alice"), 3).with_old_seq(2));
        assert_eq!(records[1], DeltaRecord::delete(device("/bob")).with_old_seq(4));
        assert_eq!(records[1].missing_range(), None);
    }

    fn updates() -> impl Strategy<Value = Vec<(u8, u64)>> {
        prop::collection::vec((0u8..6, 0u64..50), 0..40)
    }

    fn snapshot_of(updates: &[(u8, u64)]) -> StateSnapshot {
        StateSnapshot::from_entries(
            updates
                .iter()
                .map(|(d, s)| (device(&format!("/device-{}", d)), *s)),
        )
    }

    proptest! {
        #[test]
        fn prop_digest_is_order_independent(
            (ups, shuffled) in updates().prop_flat_map(|ups| (Just(ups.clone()), Just(ups).prop_shuffle()))
        ) {
            prop_assert_eq!(snapshot_of(&ups).digest(), snapshot_of(&shuffled).digest());
        }

        #[test]
        fn prop_merge_is_idempotent(ups in updates()) {
            let mut snapshot = snapshot_of(&ups);
            let before = snapshot.digest();
            for (d, s) in &ups {
                snapshot.merge(device(&format!("/device-{}", d)), *s);
            }
            prop_assert_eq!(before, snapshot.digest());
        }

        #[test]
        fn prop_diff_roundtrip(a in updates(), b in updates()) {
            let old = snapshot_of(&a);
            let new = snapshot_of(&b);
            let mut replayed = old.clone();
            replayed.apply(&old.diff(&new, false));
            prop_assert_eq!(replayed, new);
        }

        #[test]
        fn prop_diff_symmetry(a in updates(), b in updates()) {
            let sa = snapshot_of(&a);
            let sb = snapshot_of(&b);
            let forward = sa.diff(&sb, true);
            let backward = sb.diff(&sa, true);
            prop_assert_eq!(forward.len(), backward.len());
            for (f, r) in forward.iter().zip(backward.iter()) {
                prop_assert_eq!(&f.device, &r.device);
                match (f.kind, r.kind) {
                    (DeltaKind::Update, DeltaKind::Update) => {
                        prop_assert_eq!(Some(f.seq), r.old_seq);
                        prop_assert_eq!(f.old_seq, Some(r.seq));
                    }
                    (DeltaKind::Update, DeltaKind::Delete) => {
                        prop_assert_eq!(f.old_seq, Some(0));
                        prop_assert_eq!(r.old_seq, Some(f.seq));
                    }
                    (DeltaKind::Delete, DeltaKind::Update) => {
                        prop_assert_eq!(r.old_seq, Some(0));
                        prop_assert_eq!(f.old_seq, Some(r.seq));
                    }
                    (DeltaKind::Delete, DeltaKind::Delete) => prop_assert!(false, "both deletes"),
                }
            }
        }

        #[test]
        fn prop_merge_never_decreases(d in 0u8..4, s in 1u64..100, lower in 0u64..100) {
            let mut snapshot = StateSnapshot::new();
            let dev = device(&format!("/device-{}", d));
            snapshot.merge(dev.clone(), s);
            snapshot.merge(dev.clone(), lower);
            prop_assert_eq!(snapshot.get(&dev), Some(s.max(lower)));
        }
    }
}
