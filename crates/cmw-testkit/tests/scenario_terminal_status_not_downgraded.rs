//! Scenario: terminal statuses are sticky across ERP pulls.
//!
//! # Invariant under test
//! A consultation that reaches `closed`/`resolved`/`cancelled` never
//! transitions back to an active status through an ERP pull, no matter how
//! many times the source record is replayed; other fields keep updating.

use chrono::{TimeZone, Utc};

use cmw_etl::merge::merge_consultation;
use cmw_mappers::{KIND_ACCOUNTING, KIND_QUEUE};
use cmw_schemas::{ConsStatus, ErpConsultation};

const KEY: &str = "15d38cda-1812-11ef-b824-c67597d01fa8";

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
}

fn open_record() -> ErpConsultation {
    ErpConsultation {
        ref_key: Some(KEY.to_string()),
        number: Some("CL-1".to_string()),
        request_kind: Some(KIND_ACCOUNTING.to_string()),
        ..Default::default()
    }
}

#[test]
fn closed_consultation_ignores_reopening_pull() {
    // Establish an open consultation, then close it via an end date.
    let stored = merge_consultation(None, &open_record(), now(), false).unwrap().row;
    let mut closing = open_record();
    closing.end_date = Some("2025-03-02T10:15:00".to_string());
    let closed = merge_consultation(Some(&stored), &closing, now(), false).unwrap().row;
    assert_eq!(closed.status, ConsStatus::Closed);

    // The ERP now claims the document is queued again; the status must hold.
    let mut reopening = open_record();
    reopening.request_kind = Some(KIND_QUEUE.to_string());
    reopening.number = Some("CL-1-upd".to_string());
    let out = merge_consultation(Some(&closed), &reopening, now(), false).unwrap();

    assert_eq!(out.row.status, ConsStatus::Closed, "terminal status must stick");
    assert!(out.status_change.is_none());
    assert!(out.fanout.is_none(), "no chat fan-out for a guarded status");
    assert_eq!(out.row.number.as_deref(), Some("CL-1-upd"), "other fields still update");
}

#[test]
fn cancelled_consultation_survives_arbitrary_replay_sequences() {
    let mut denied = open_record();
    denied.closed_without_consultation = true;
    let cancelled = merge_consultation(None, &denied, now(), false).unwrap().row;
    assert_eq!(cancelled.status, ConsStatus::Cancelled);
    assert!(cancelled.denied);

    let mut row = cancelled;
    for kind in [KIND_ACCOUNTING, KIND_QUEUE, "Other"] {
        let mut record = open_record();
        record.request_kind = Some(kind.to_string());
        let out = merge_consultation(Some(&row), &record, now(), false).unwrap();
        assert_eq!(out.row.status, ConsStatus::Cancelled);
        row = out.row;
    }
}

#[test]
fn denied_iff_cancelled_after_any_pull() {
    // denied=true forces cancelled even with an end date present.
    let mut record = open_record();
    record.closed_without_consultation = true;
    record.end_date = Some("2025-03-02T10:15:00".to_string());
    let row = merge_consultation(None, &record, now(), false).unwrap().row;
    assert!(row.denied);
    assert_eq!(row.status, ConsStatus::Cancelled);

    // Without the flag the same record closes normally.
    let mut record = open_record();
    record.end_date = Some("2025-03-02T10:15:00".to_string());
    let row = merge_consultation(None, &record, now(), false).unwrap().row;
    assert!(!row.denied);
    assert_eq!(row.status, ConsStatus::Closed);
}

#[test]
fn unchanged_record_produces_zero_writes() {
    let record = open_record();
    let stored = merge_consultation(None, &record, now(), false).unwrap().row;

    // Replay the identical record many times: never a write.
    let mut current = stored;
    for _ in 0..5 {
        let out = merge_consultation(Some(&current), &record, now(), false).unwrap();
        assert!(!out.changed, "replaying an unchanged record must not write");
        current = out.row;
    }
}
