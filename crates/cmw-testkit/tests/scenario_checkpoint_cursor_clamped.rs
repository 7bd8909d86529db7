//! Scenario: the sync cursor is monotone and never passes the wall clock.
//!
//! Scheduled consultations carry future change dates; processing them must
//! not pin the checkpoint forward, or the next incremental window would skip
//! everything edited in between.

use chrono::{Duration, TimeZone, Utc};

use cmw_db::effective_from;
use cmw_etl::fold_cursor;
use cmw_schemas::Checkpoint;

#[test]
fn future_source_timestamps_clamp_to_now() {
    let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
    let past = Utc.with_ymd_and_hms(2025, 3, 9, 8, 0, 0).unwrap();
    let future = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();

    let mut cursor = None;
    for observed in [past, future, past] {
        cursor = fold_cursor(cursor, observed, now);
    }
    assert_eq!(cursor, Some(now), "the future row advances the cursor only to now");
}

#[test]
fn cursor_never_decreases_within_a_run() {
    let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
    let mut cursor = None;
    let mut highest = None;

    for minutes in [10i64, 50, 30, 70, 5] {
        let observed = now - Duration::minutes(100 - minutes);
        cursor = fold_cursor(cursor, observed, now);
        highest = highest.max(Some(observed));
        assert_eq!(cursor, highest);
    }
}

#[test]
fn next_window_subtracts_the_buffer_from_the_clamped_cursor() {
    let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();

    // A stored cursor that ended up in the future (pre-clamp data) is
    // treated as "now" before the buffer applies.
    let poisoned = Checkpoint {
        last_synced_at: Some(now + Duration::days(30)),
        last_synced_key: None,
    };
    let from = effective_from(&poisoned, now, Duration::days(7)).unwrap();
    assert_eq!(from, now - Duration::days(7));

    // A healthy cursor gets the plain buffer window.
    let healthy = Checkpoint {
        last_synced_at: Some(now - Duration::days(2)),
        last_synced_key: None,
    };
    let from = effective_from(&healthy, now, Duration::hours(6)).unwrap();
    assert_eq!(from, now - Duration::days(2) - Duration::hours(6));

    // First run has no window at all.
    assert_eq!(effective_from(&Checkpoint::default(), now, Duration::days(7)), None);
}

#[test]
fn ratings_cursor_skips_only_strictly_preceding_keys() {
    // Textual UUID order is the contract for the key cursor: a row is
    // skipped only when its key sorts strictly before the stored key.
    let cursor = "25d38cda-1812-11ef-b824-c67597d01fa8";
    let before = "15d38cda-1812-11ef-b824-c67597d01fa8";
    let equal = cursor;
    let after = "35d38cda-1812-11ef-b824-c67597d01fa8";

    assert!(before < cursor, "sanity: textual order");
    // The puller's rule: process everything not strictly below the cursor.
    assert!(!(equal < cursor), "the cursor row itself is reprocessed (upsert makes it safe)");
    assert!(!(after < cursor));
    assert!(before < cursor, "late-arriving lower keys are skipped by design");
}
