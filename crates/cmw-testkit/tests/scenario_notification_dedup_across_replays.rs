//! Scenario: the notification ledger sends each distinct side effect at most
//! once, across arbitrarily many runs.
//!
//! The ledger itself is a unique-hash table; these tests drive the hash
//! contract through an in-process gate that mirrors
//! `check_and_record_notification` (first call per hash opens, all later
//! calls stay closed), the same way the store enforces it with its unique
//! constraint.

use std::collections::HashSet;

use serde_json::json;

use cmw_notify::{notification_hash, types};

/// Mirrors the ledger's idempotency contract without a database: returns
/// true the first time a hash is seen.
fn ledger_gate(seen: &mut HashSet<String>, hash: &str) -> bool {
    seen.insert(hash.to_string())
}

#[test]
fn same_reschedule_never_sends_twice() {
    let mut ledger = HashSet::new();
    let mut sent = 0;

    // Two pull runs observe the same reschedule tuple.
    for _run in 0..2 {
        let data = json!({
            "old_date": "2025-03-03T09:00:00+00:00",
            "new_date": "2025-03-04T12:00:00+00:00",
            "manager_key": "25d38cda-1812-11ef-b824-c67597d01fa8",
        });
        let hash = notification_hash(types::REDATE, "42", Some(&data));
        if ledger_gate(&mut ledger, &hash) {
            sent += 1;
        }
    }
    assert_eq!(sent, 1, "exactly one redate message across replays");
}

#[test]
fn a_genuinely_new_reschedule_sends_again() {
    let mut ledger = HashSet::new();

    let first = json!({ "old_date": null, "new_date": "2025-03-04T12:00:00+00:00", "manager_key": "m" });
    let second = json!({ "old_date": "2025-03-04T12:00:00+00:00", "new_date": "2025-03-06T10:00:00+00:00", "manager_key": "m" });

    assert!(ledger_gate(&mut ledger, &notification_hash(types::REDATE, "42", Some(&first))));
    assert!(ledger_gate(&mut ledger, &notification_hash(types::REDATE, "42", Some(&second))));
}

#[test]
fn queue_update_hash_excludes_volatile_wait_numbers() {
    // The wait estimate changes run to run; only (manager, position)
    // identify the event. Hashing the identifying tuple twice must agree.
    let identifying = json!({ "manager_key": "m1", "queue_position": 3 });
    let h1 = notification_hash(types::QUEUE_UPDATE, "42", Some(&identifying));
    let h2 = notification_hash(types::QUEUE_UPDATE, "42", Some(&identifying));
    assert_eq!(h1, h2);

    // A different queue position is a different logical event.
    let moved = json!({ "manager_key": "m1", "queue_position": 2 });
    assert_ne!(h1, notification_hash(types::QUEUE_UPDATE, "42", Some(&moved)));
}

#[test]
fn deleted_in_erp_close_fires_exactly_once() {
    // Open-update mode marks a queried-but-missing key cancelled; later runs
    // re-derive the same hash and stay silent.
    let mut ledger = HashSet::new();
    let data = json!({ "status": "cancelled", "reason": "deleted_in_erp" });

    let mut sends = 0;
    for _run in 0..5 {
        let hash = notification_hash(types::STATUS_CLOSE, "77", Some(&data));
        if ledger_gate(&mut ledger, &hash) {
            sends += 1;
        }
    }
    assert_eq!(sends, 1);
}

#[test]
fn null_and_missing_manager_normalize_identically() {
    // None values normalize to empty strings so optional fields cannot split
    // one logical event into two hashes.
    let with_null = json!({ "manager_key": null, "queue_position": 1 });
    let with_empty = json!({ "manager_key": "", "queue_position": 1 });
    assert_eq!(
        notification_hash(types::QUEUE_UPDATE, "9", Some(&with_null)),
        notification_hash(types::QUEUE_UPDATE, "9", Some(&with_empty)),
    );
}

#[test]
fn entity_and_type_partition_the_ledger() {
    let data = json!({ "rating": 5 });
    let mut hashes = HashSet::new();
    for (ty, entity) in [
        (types::RATING, "1"),
        (types::RATING, "2"),
        (types::REDATE, "1"),
        (types::STATUS_CLOSE, "1"),
    ] {
        assert!(
            hashes.insert(notification_hash(ty, entity, Some(&data))),
            "hash collision between distinct (type, entity) pairs"
        );
    }
}
