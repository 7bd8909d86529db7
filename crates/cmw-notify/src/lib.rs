//! At-most-once outbound side-effect messages.
//!
//! Every sender here follows the same protocol: compute the identifying
//! hash, consult the ledger (`check_and_record_notification` commits on its
//! own connection, independent of any pull batch), send on a fresh key, and
//! delete the key again if the send itself fails so a later run can retry.
//! Chat failures never propagate — a pull must not die on downstream errors.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Value};
use sqlx::{PgConnection, PgPool};
use tracing::{debug, warn};
use uuid::Uuid;

use cmw_chat::{ChatApi, ConversationUpdate};
use cmw_db::ConsultationRow;
use cmw_schemas::{ConsId, ConsultationType};

pub mod hash;

pub use hash::{normalize_data, notification_hash};

/// Ledger notification types.
pub mod types {
    pub const REDATE: &str = "redate";
    pub const RATING: &str = "rating";
    pub const MANAGER_REASSIGNMENT: &str = "manager_reassignment";
    pub const QUEUE_UPDATE: &str = "queue_update";
    pub const STATUS_CLOSE: &str = "status_close";
    pub const QUEUE_CLOSED: &str = "queue_closed";
}

const UNASSIGNED: &str = "unassigned";

/// Returns true when this call holds a fresh ledger key and should send.
async fn acquire_send_slot(
    pool: &PgPool,
    notification_type: &str,
    entity_id: &str,
    data: &Value,
) -> Result<Option<String>> {
    let hash = notification_hash(notification_type, entity_id, Some(data));
    let already_sent =
        cmw_db::check_and_record_notification(pool, notification_type, entity_id, &hash).await?;
    if already_sent {
        debug!(notification_type, entity_id, "notification already sent, skipping");
        Ok(None)
    } else {
        Ok(Some(hash))
    }
}

/// Drop the ledger key after a failed send so the fan-out is retried later.
async fn release_send_slot(pool: &PgPool, hash: &str) {
    if let Err(e) = cmw_db::remove_notification(pool, hash).await {
        warn!(error = %e, "failed to release notification slot after send error");
    }
}

async fn display_name(conn: &mut PgConnection, key: Option<Uuid>) -> String {
    match key {
        None => UNASSIGNED.to_string(),
        Some(key) => match cmw_db::user_display_name(conn, key).await {
            Ok(Some(name)) => name,
            _ => short_key(key),
        },
    }
}

fn short_key(key: Uuid) -> String {
    let s = key.to_string();
    format!("{}…", &s[..8])
}

fn fmt_dt(dt: &DateTime<Utc>) -> String {
    dt.format("%d.%m.%Y %H:%M").to_string()
}

// ---------------------------------------------------------------------------
// Manager reassignment
// ---------------------------------------------------------------------------

/// Post the reassignment message and update the conversation assignee.
pub async fn send_manager_reassignment(
    pool: &PgPool,
    conn: &mut PgConnection,
    chat: &dyn ChatApi,
    consultation: &ConsultationRow,
    old_manager_key: Option<Uuid>,
    new_manager_key: Option<Uuid>,
    reason: &str,
) -> Result<()> {
    let Some(conversation_id) = ConsId::parse(&consultation.cons_id).chat_id() else {
        debug!(cons_id = %consultation.cons_id, "skipping reassignment notice: not a chat id");
        return Ok(());
    };

    let data = json!({
        "old_manager_key": old_manager_key.map(|k| k.to_string()),
        "new_manager_key": new_manager_key.map(|k| k.to_string()),
        "reason": reason,
    });
    let Some(slot) = acquire_send_slot(
        pool,
        types::MANAGER_REASSIGNMENT,
        &consultation.cons_id,
        &data,
    )
    .await?
    else {
        return Ok(());
    };

    let old_name = display_name(conn, old_manager_key).await;
    let new_name = display_name(conn, new_manager_key).await;

    let mut message = String::from("Your consultation was reassigned.");
    if old_manager_key.is_some() {
        message.push_str(&format!("\nPrevious operator: {old_name}"));
    }
    message.push_str(&format!("\nNew operator: {new_name}"));
    if !reason.is_empty() {
        message.push_str(&format!("\nReason: {reason}"));
    }

    if let Err(e) = chat.send_message(conversation_id, &message).await {
        warn!(conversation_id, error = %e, "failed to send reassignment message");
        release_send_slot(pool, &slot).await;
        return Ok(());
    }

    // Mirror the assignment itself through the dedicated endpoint.
    match new_manager_key {
        Some(manager_key) => {
            match cmw_db::chat_user_for_manager_key(conn, manager_key).await? {
                Some(assignee_id) if assignee_id > 0 => {
                    if let Err(e) = chat
                        .assign_conversation_agent(conversation_id, assignee_id as u64)
                        .await
                    {
                        warn!(conversation_id, assignee_id, error = %e, "agent assignment failed");
                    }
                }
                _ => warn!(
                    conversation_id,
                    manager_key = %manager_key,
                    "operator has no chat identity; conversation assignee left unchanged"
                ),
            }
        }
        None => {
            if let Err(e) = chat
                .update_conversation(conversation_id, &ConversationUpdate::clear_assignee())
                .await
            {
                warn!(conversation_id, error = %e, "failed to clear conversation assignee");
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Queue update
// ---------------------------------------------------------------------------

/// Post the queue-position message for a consultation's operator.
///
/// Tech-support consultations have no queue and never receive this message.
/// Wait-time numbers are display-only and excluded from the dedup hash —
/// only `(manager, queue position)` identify the event.
pub async fn send_queue_update(
    pool: &PgPool,
    conn: &mut PgConnection,
    chat: &dyn ChatApi,
    consultation: &ConsultationRow,
    manager_key: Option<&str>,
    now: DateTime<Utc>,
    include_wait_time: bool,
) -> Result<()> {
    let Some(conversation_id) = ConsId::parse(&consultation.cons_id).chat_id() else {
        return Ok(());
    };
    if consultation.consultation_type == ConsultationType::TechSupport {
        debug!(cons_id = %consultation.cons_id, "no queue messages for tech support");
        return Ok(());
    }
    let Some(manager_key) = manager_key.or(consultation.manager.as_deref()) else {
        debug!(cons_id = %consultation.cons_id, "no manager, skipping queue notice");
        return Ok(());
    };

    let wait = cmw_selector::wait_estimate_for(conn, manager_key, now).await?;

    let data = json!({
        "manager_key": manager_key,
        "queue_position": wait.queue_position,
    });
    let Some(slot) =
        acquire_send_slot(pool, types::QUEUE_UPDATE, &consultation.cons_id, &data).await?
    else {
        return Ok(());
    };

    let mut message = format!("You are #{} in the queue.", wait.queue_position);
    if include_wait_time {
        if wait.show_range && wait.wait_minutes_min != wait.wait_minutes_max {
            message.push_str(&format!(
                " Estimated wait: between {} and {}.",
                fmt_minutes(wait.wait_minutes_min),
                fmt_minutes(wait.wait_minutes_max)
            ));
        } else {
            message.push_str(&format!(
                " Estimated wait: about {}.",
                fmt_minutes(wait.wait_minutes_max)
            ));
        }
    } else {
        message.push_str(" You will learn the expected wait time in this chat.");
    }

    if let Err(e) = chat.send_message(conversation_id, &message).await {
        warn!(conversation_id, error = %e, "failed to send queue update");
        release_send_slot(pool, &slot).await;
    }
    Ok(())
}

fn fmt_minutes(minutes: i64) -> String {
    if minutes < 60 {
        format!("{minutes} minutes")
    } else {
        let hours = (minutes as f64 / 60.0).round() as i64;
        if hours == 1 {
            "1 hour".to_string()
        } else {
            format!("{hours} hours")
        }
    }
}

// ---------------------------------------------------------------------------
// Rating
// ---------------------------------------------------------------------------

pub async fn send_rating_notification(
    pool: &PgPool,
    conn: &mut PgConnection,
    chat: &dyn ChatApi,
    cons_id: &str,
    rating: i64,
    question_text: Option<&str>,
    manager_key: Option<Uuid>,
) -> Result<()> {
    let Some(conversation_id) = ConsId::parse(cons_id).chat_id() else {
        return Ok(());
    };

    // Long question texts are clipped so the hash stays stable.
    let clipped: Option<String> = question_text.map(|q| q.chars().take(100).collect());

    let data = json!({
        "rating": rating,
        "question_text": clipped,
        "manager_key": manager_key.map(|k| k.to_string()),
    });
    let Some(slot) = acquire_send_slot(pool, types::RATING, cons_id, &data).await? else {
        return Ok(());
    };

    let mut message = format!("Consultation rating received: {rating}/5");
    if let Some(q) = &clipped {
        message.push_str(&format!("\nQuestion: {q}"));
    }
    if let Some(key) = manager_key {
        let name = display_name(conn, Some(key)).await;
        message.push_str(&format!("\nOperator: {name}"));
    }

    if let Err(e) = chat.send_message(conversation_id, &message).await {
        warn!(conversation_id, error = %e, "failed to send rating message");
        release_send_slot(pool, &slot).await;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Reschedule
// ---------------------------------------------------------------------------

pub async fn send_redate_notification(
    pool: &PgPool,
    conn: &mut PgConnection,
    chat: &dyn ChatApi,
    cons_id: &str,
    old_date: Option<DateTime<Utc>>,
    new_date: DateTime<Utc>,
    manager_key: Option<Uuid>,
) -> Result<()> {
    let Some(conversation_id) = ConsId::parse(cons_id).chat_id() else {
        return Ok(());
    };

    let data = json!({
        "old_date": old_date.map(|d| d.to_rfc3339()),
        "new_date": new_date.to_rfc3339(),
        "manager_key": manager_key.map(|k| k.to_string()),
    });
    let Some(slot) = acquire_send_slot(pool, types::REDATE, cons_id, &data).await? else {
        return Ok(());
    };

    let old_str = old_date
        .map(|d| fmt_dt(&d))
        .unwrap_or_else(|| "not set".to_string());
    let mut message = format!(
        "Your consultation was rescheduled.\nPrevious date: {old_str}\nNew date: {}",
        fmt_dt(&new_date)
    );
    if let Some(key) = manager_key {
        let name = display_name(conn, Some(key)).await;
        message.push_str(&format!("\nOperator: {name}"));
    }

    if let Err(e) = chat.send_message(conversation_id, &message).await {
        warn!(conversation_id, error = %e, "failed to send reschedule message");
        release_send_slot(pool, &slot).await;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Closing messages
// ---------------------------------------------------------------------------

/// Resolve the conversation and announce a manager-side close, with the call
/// duration when known. At most one close event per `(cons, end_date)`.
pub async fn send_status_close(
    pool: &PgPool,
    chat: &dyn ChatApi,
    cons_id: &str,
    duration_minutes: Option<i64>,
    end_date: Option<DateTime<Utc>>,
) -> Result<()> {
    let Some(conversation_id) = ConsId::parse(cons_id).chat_id() else {
        return Ok(());
    };

    let data = json!({
        "status": "closed",
        "end_date": end_date.map(|d| d.to_rfc3339()),
    });
    let Some(slot) = acquire_send_slot(pool, types::STATUS_CLOSE, cons_id, &data).await? else {
        return Ok(());
    };

    let message = match duration_minutes {
        Some(minutes) => format!(
            "The request was closed by the manager. The call lasted {minutes} minutes."
        ),
        None => "The request was closed by the manager.".to_string(),
    };

    let toggled = chat
        .toggle_conversation_status(conversation_id, "resolved")
        .await;
    let sent = match toggled {
        Ok(()) => chat.send_message(conversation_id, &message).await,
        Err(e) => Err(e),
    };
    if let Err(e) = sent {
        warn!(conversation_id, error = %e, "failed to close conversation in chat");
        release_send_slot(pool, &slot).await;
    }
    Ok(())
}

/// Resolve the conversation for a consultation that disappeared from ERP.
/// Fires exactly once per consultation.
pub async fn send_deleted_close(pool: &PgPool, chat: &dyn ChatApi, cons_id: &str) -> Result<()> {
    let Some(conversation_id) = ConsId::parse(cons_id).chat_id() else {
        return Ok(());
    };

    let data = json!({ "status": "cancelled", "reason": "deleted_in_erp" });
    let Some(slot) = acquire_send_slot(pool, types::STATUS_CLOSE, cons_id, &data).await? else {
        return Ok(());
    };

    let toggled = chat
        .toggle_conversation_status(conversation_id, "resolved")
        .await;
    let sent = match toggled {
        Ok(()) => {
            chat.send_message(conversation_id, "The request was deleted in the system.")
                .await
        }
        Err(e) => Err(e),
    };
    if let Err(e) = sent {
        warn!(conversation_id, error = %e, "failed to announce deleted consultation");
        release_send_slot(pool, &slot).await;
    }
    Ok(())
}

/// Warn a client that their operator's queue is closed for the day.
pub async fn send_queue_closed_notice(
    pool: &PgPool,
    chat: &dyn ChatApi,
    cons_id: &str,
    manager_key: Uuid,
    manager_name: &str,
    day: NaiveDate,
) -> Result<()> {
    let Some(conversation_id) = ConsId::parse(cons_id).chat_id() else {
        return Ok(());
    };

    let data = json!({
        "manager_key": manager_key.to_string(),
        "day": day.to_string(),
    });
    let Some(slot) = acquire_send_slot(pool, types::QUEUE_CLOSED, cons_id, &data).await? else {
        return Ok(());
    };

    let message = format!(
        "The queue for {manager_name} is closed on {}. Your consultation will shortly be reassigned to another operator.",
        day.format("%d.%m.%Y")
    );
    if let Err(e) = chat.send_message(conversation_id, &message).await {
        warn!(conversation_id, error = %e, "failed to send queue-closed notice");
        release_send_slot(pool, &slot).await;
    }
    Ok(())
}
