//! Scenario: an accounting consultation closed in ERP resolves the chat
//! conversation with a duration message — once.
//!
//! Source: consultation with `start=10:00`, `end=10:15`, previously open.
//! Expected: the merge flips the store status to `closed` and plans a
//! resolve-toggle plus a "call lasted 15 minutes" message; replaying the same
//! source produces no further fan-out (the status is terminal and the ledger
//! hash repeats).

use std::collections::HashSet;

use chrono::{TimeZone, Utc};
use serde_json::json;

use cmw_etl::merge::{merge_consultation, StatusFanout};
use cmw_mappers::KIND_ACCOUNTING;
use cmw_notify::{notification_hash, types};
use cmw_schemas::{ConsStatus, ErpConsultation};
use cmw_testkit::{ChatCall, RecordingChat};

use cmw_chat::ChatApi;

const KEY: &str = "15d38cda-1812-11ef-b824-c67597d01fa8";

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 2, 11, 0, 0).unwrap()
}

fn closing_record() -> ErpConsultation {
    ErpConsultation {
        ref_key: Some(KEY.to_string()),
        request_kind: Some(KIND_ACCOUNTING.to_string()),
        consultation_date: Some("2025-03-02T10:00:00".to_string()),
        end_date: Some("2025-03-02T10:15:00".to_string()),
        ..Default::default()
    }
}

/// Drive the fan-out the way the puller does: gate on the ledger hash, then
/// toggle + message.
async fn fan_out(
    chat: &RecordingChat,
    ledger: &mut HashSet<String>,
    conversation_id: u64,
    cons_id: &str,
    duration_minutes: i64,
    end_date: &str,
) {
    let data = json!({ "status": "closed", "end_date": end_date });
    let hash = notification_hash(types::STATUS_CLOSE, cons_id, Some(&data));
    if !ledger.insert(hash) {
        return;
    }
    chat.toggle_conversation_status(conversation_id, "resolved")
        .await
        .unwrap();
    chat.send_message(
        conversation_id,
        &format!("The request was closed by the manager. The call lasted {duration_minutes} minutes."),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn close_resolves_and_announces_duration_exactly_once() {
    // Open consultation already stitched to chat conversation 4711.
    let open = ErpConsultation {
        ref_key: Some(KEY.to_string()),
        request_kind: Some(KIND_ACCOUNTING.to_string()),
        ..Default::default()
    };
    let mut stored = merge_consultation(None, &open, now(), false).unwrap().row;
    stored.cons_id = "4711".to_string();

    // First pull of the closing record.
    let out = merge_consultation(Some(&stored), &closing_record(), now(), false).unwrap();
    assert_eq!(out.row.status, ConsStatus::Closed);
    let Some(StatusFanout::Close {
        duration_minutes,
        end_date,
    }) = out.fanout.clone()
    else {
        panic!("closing pull must plan a close fan-out, got {:?}", out.fanout);
    };
    assert_eq!(duration_minutes, Some(15));

    let chat = RecordingChat::new();
    let mut ledger = HashSet::new();
    let end = end_date.unwrap().to_rfc3339();
    fan_out(&chat, &mut ledger, 4711, &out.row.cons_id, 15, &end).await;

    let calls = chat.calls();
    assert_eq!(
        calls[0],
        ChatCall::ToggleStatus {
            conversation_id: 4711,
            status: "resolved".to_string()
        }
    );
    assert_eq!(
        chat.messages_sent(),
        vec!["The request was closed by the manager. The call lasted 15 minutes.".to_string()]
    );

    // Re-running the puller on the same source: the status is terminal, the
    // merge plans nothing, and even a crash-replay of the fan-out is
    // absorbed by the ledger hash.
    let replay = merge_consultation(Some(&out.row), &closing_record(), now(), false).unwrap();
    assert!(replay.fanout.is_none());
    assert!(!replay.changed);

    fan_out(&chat, &mut ledger, 4711, &out.row.cons_id, 15, &end).await;
    assert_eq!(chat.calls().len(), 2, "no additional chat calls on replay");
}

#[tokio::test]
async fn close_without_dates_omits_the_duration_clause() {
    let open = ErpConsultation {
        ref_key: Some(KEY.to_string()),
        request_kind: Some(KIND_ACCOUNTING.to_string()),
        ..Default::default()
    };
    let stored = merge_consultation(None, &open, now(), false).unwrap().row;

    let mut closing = closing_record();
    closing.consultation_date = None;
    let out = merge_consultation(Some(&stored), &closing, now(), false).unwrap();

    match out.fanout {
        Some(StatusFanout::Close {
            duration_minutes, ..
        }) => assert_eq!(duration_minutes, None, "unknown start date means no duration"),
        other => panic!("expected close fan-out, got {other:?}"),
    }
}
