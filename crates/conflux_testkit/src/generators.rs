//! Property-based test generators using proptest.

use conflux_protocol::{Change, ChangeKind};
use proptest::prelude::*;
use std::collections::HashMap;

/// Strategy for record uids.
pub fn uid_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9-]{0,15}").expect("invalid regex")
}

/// Strategy for opaque record payloads.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..64)
}

/// Strategy for classified change kinds (never `Unknown`).
pub fn known_kind_strategy() -> impl Strategy<Value = ChangeKind> {
    prop_oneof![
        Just(ChangeKind::Added),
        Just(ChangeKind::Modified),
        Just(ChangeKind::Deleted),
        Just(ChangeKind::Unmodified),
    ]
}

/// Strategy for complete change records.
///
/// Deletions carry no payload; everything else does.
pub fn change_strategy() -> impl Strategy<Value = Change> {
    (uid_strategy(), known_kind_strategy(), payload_strategy()).prop_map(|(uid, kind, payload)| {
        if kind == ChangeKind::Deleted {
            Change::deleted(uid)
        } else {
            Change::new(uid, kind, payload)
        }
    })
}

/// Strategy for a member's record map, suitable for seeding a
/// [`SharedRecords`](crate::fixtures::SharedRecords).
pub fn record_map_strategy(max_records: usize) -> impl Strategy<Value = HashMap<String, Vec<u8>>> {
    prop::collection::hash_map(uid_strategy(), payload_strategy(), 0..max_records)
}
