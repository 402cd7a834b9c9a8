//! Proptest generators for property-based testing.

use proptest::prelude::*;

use driftsync_core::{DeltaRecord, DeviceId, FetchTask, Name, Priority, StateSnapshot};

/// Generate a name component.
pub fn component() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,11}".prop_map(String::from)
}

/// Generate a name of 1 to 4 components.
pub fn name() -> impl Strategy<Value = Name> {
    prop::collection::vec(component(), 1..=4).prop_map(Name::from_components)
}

/// Generate a device from a small pool, so generated states overlap.
pub fn device_id() -> impl Strategy<Value = DeviceId> {
    (0u8..8).prop_map(|i| DeviceId::new(Name::new().append("device").append(format!("d{}", i))))
}

/// Generate a valid sequence number (1-indexed).
pub fn seq() -> impl Strategy<Value = u64> {
    1u64..=10_000u64
}

/// Generate a list of `(device, seq)` updates.
pub fn updates() -> impl Strategy<Value = Vec<(DeviceId, u64)>> {
    prop::collection::vec((device_id(), seq()), 0..24)
}

/// Generate a sequence number anywhere in `u64`, biased toward both ends.
pub fn any_seq() -> impl Strategy<Value = u64> {
    prop_oneof![
        seq(),
        any::<u64>(),
        (i64::MAX as u64 - 8)..=(i64::MAX as u64 + 8),
        (u64::MAX - 16)..=u64::MAX,
    ]
}

/// Generate updates whose sequences span the whole `u64` range.
pub fn full_range_updates() -> impl Strategy<Value = Vec<(DeviceId, u64)>> {
    prop::collection::vec((device_id(), any_seq()), 0..24)
}

/// Generate a state snapshot.
pub fn snapshot() -> impl Strategy<Value = StateSnapshot> {
    updates().prop_map(StateSnapshot::from_entries)
}

/// Generate a Priority.
pub fn priority() -> impl Strategy<Value = Priority> {
    prop_oneof![Just(Priority::Normal), Just(Priority::High)]
}

/// Generate a non-empty fetch task for a device's action log.
pub fn fetch_task() -> impl Strategy<Value = FetchTask> {
    (device_id(), seq(), 0u64..64, priority()).prop_map(|(producer, min, extra, priority)| {
        let base = producer.as_name().clone().append("actions");
        FetchTask::new(producer, base, min, min + extra, priority)
    })
}

/// Generate an update record, with or without an old sequence and locator.
pub fn delta_record() -> impl Strategy<Value = DeltaRecord> {
    (
        device_id(),
        seq(),
        prop::option::of(0u64..10_000),
        prop::option::of(name()),
    )
        .prop_map(|(device, seq, old_seq, locator)| {
            let mut record = DeltaRecord::update(device, seq);
            record.old_seq = old_seq;
            record.locator = locator;
            record
        })
}
