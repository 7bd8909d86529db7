//! Axum router and webhook handlers.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use sqlx::PgConnection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cmw_schemas::{
    events, ChangeSource, ConsId, ConsStatus, ConsultationType, WebhookConversation,
    WebhookEnvelope, WebhookResponse,
};

use cmw_db::ConsultationRow;

use crate::signature::verify_signature;
use crate::state::AppState;
use crate::tasks::ErpWrite;

const SIGNATURE_HEADER: &str = "x-chatwoot-signature";

/// Build the application router wired to the shared state. Middleware layers
/// (tracing) are attached in `main.rs` so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhooks/chat", post(chat_webhook))
        .with_state(state)
}

pub(crate) async fn chat_webhook(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "detail": format!("invalid json: {e}") })),
            )
                .into_response();
        }
    };

    // The raw payload is persisted before any processing so failures stay
    // auditable; this row survives handler rollbacks.
    let log_id = match cmw_db::insert_webhook_log(&st.pool, "CHAT", &payload).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "failed to persist webhook payload");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": "webhook log unavailable" })),
            )
                .into_response();
        }
    };

    // Signature check. An unsigned webhook is tolerated only while no
    // secret is configured (development).
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    if st.settings.webhook_signature_required() {
        let valid = signature
            .map(|sig| verify_signature(&st.settings.chat_webhook_secret, &body, sig))
            .unwrap_or(false);
        if !valid {
            let _ = cmw_db::mark_webhook_error(&st.pool, log_id, "invalid signature").await;
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "detail": "invalid signature" })),
            )
                .into_response();
        }
    }

    let envelope: WebhookEnvelope = match serde_json::from_value(payload) {
        Ok(env) => env,
        Err(e) => {
            let _ = cmw_db::mark_webhook_error(&st.pool, log_id, &e.to_string()).await;
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "detail": format!("unrecognized payload: {e}") })),
            )
                .into_response();
        }
    };

    match process_event(&st, &envelope).await {
        Ok(response) => {
            let _ = cmw_db::mark_webhook_processed(&st.pool, log_id).await;
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => {
            warn!(event = %envelope.event, error = %e, "webhook processing failed");
            let _ = cmw_db::mark_webhook_error(&st.pool, log_id, &format!("{e:#}")).await;
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": format!("error processing webhook: {e}") })),
            )
                .into_response()
        }
    }
}

async fn process_event(
    st: &Arc<AppState>,
    envelope: &WebhookEnvelope,
) -> anyhow::Result<WebhookResponse> {
    let mut tx = st.pool.begin().await?;

    let response = match envelope.event.as_str() {
        events::CONVERSATION_CREATED => {
            if let Some(conversation) = &envelope.data.conversation {
                handle_created(&mut tx, conversation).await?;
            }
            WebhookResponse::ok(format!("Processed {}", envelope.event))
        }
        events::CONVERSATION_UPDATED => {
            match &envelope.data.conversation {
                Some(conversation) => handle_updated(st, &mut tx, conversation).await?,
                None => WebhookResponse::ok("Processed conversation.updated (no payload)"),
            }
        }
        events::CONVERSATION_STATUS_CHANGED | events::CONVERSATION_RESOLVED => {
            match &envelope.data.conversation {
                Some(conversation) => {
                    handle_status_changed(st, &mut tx, conversation, &envelope.event).await?
                }
                None => WebhookResponse::ok("Processed status change (no payload)"),
            }
        }
        events::MESSAGE_CREATED => {
            if let Some(message) = &envelope.data.message {
                debug!(conversation_id = ?message.conversation_id, "message.created observed");
            }
            WebhookResponse::ok("Processed message.created")
        }
        other => WebhookResponse::ok(format!("Ignored unknown event {other}")),
    };

    tx.commit().await?;
    Ok(response)
}

// ---------------------------------------------------------------------------
// conversation.created
// ---------------------------------------------------------------------------

async fn handle_created(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    conversation: &WebhookConversation,
) -> anyhow::Result<()> {
    let Some(id) = conversation.id else {
        return Ok(());
    };
    let cons_id = id.to_string();

    if cmw_db::find_by_cons_id(&mut *tx, &cons_id).await?.is_some() {
        return Ok(());
    }

    let status = conversation
        .status
        .as_ref()
        .and_then(|s| s.as_deref())
        .and_then(ConsStatus::parse)
        .unwrap_or(ConsStatus::New);
    let create_date = conversation
        .created_at
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now);

    // Conversations born on the chat side are support conversations until an
    // ERP pull claims them as accounting.
    let row = ConsultationRow {
        cons_id,
        cl_ref_key: None,
        number: None,
        status,
        consultation_type: ConsultationType::TechSupport,
        denied: false,
        create_date,
        start_date: None,
        end_date: None,
        redate: None,
        redate_time: None,
        client_key: None,
        client_id: None,
        org_inn: None,
        manager: None,
        author: None,
        comment: None,
        online_question_cat: None,
        online_question: None,
        source: ChangeSource::Chat.as_str().to_string(),
        con_blocks: None,
        con_calls: None,
        con_rates: None,
    };
    cmw_db::insert_consultation(&mut *tx, &row).await?;
    info!(cons_id = %row.cons_id, "consultation created from chat webhook");
    Ok(())
}

// ---------------------------------------------------------------------------
// conversation.updated
// ---------------------------------------------------------------------------

async fn handle_updated(
    st: &Arc<AppState>,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    conversation: &WebhookConversation,
) -> anyhow::Result<WebhookResponse> {
    let Some(id) = conversation.id else {
        return Ok(WebhookResponse::ok("Processed conversation.updated (no id)"));
    };
    let cons_id = id.to_string();

    let Some(mut row) = cmw_db::find_by_cons_id(&mut *tx, &cons_id).await? else {
        debug!(cons_id, "conversation.updated for unknown consultation");
        return Ok(WebhookResponse::ok("Processed conversation.updated (unknown)"));
    };

    let mut changed = false;

    // --- status -----------------------------------------------------------
    if let Some(Some(new_status_raw)) = &conversation.status {
        if let Some(new_status) = ConsStatus::parse(new_status_raw) {
            if new_status != row.status {
                if let Some(refusal) = refuse_client_closure(st, &row, new_status).await {
                    return Ok(refusal);
                }
                apply_status_change(st, &mut *tx, &mut row, new_status, false).await?;
                changed = true;
            }
        }
    }

    // --- assignee ---------------------------------------------------------
    if let Some(assignee) = &conversation.assignee {
        let old_manager = row.manager.clone();
        let new_manager = match assignee {
            Some(agent) => match agent.id {
                Some(chat_user_id) => {
                    match cmw_db::manager_key_for_chat_user(&mut *tx, chat_user_id as i64).await? {
                        Some(key) => Some(key.to_string()),
                        None => {
                            // No mapping: keep the raw chat id so the
                            // assignment is not lost, and say so.
                            warn!(
                                cons_id,
                                chat_user_id, "no operator mapping for chat user, storing raw id"
                            );
                            Some(chat_user_id.to_string())
                        }
                    }
                }
                None => None,
            },
            None => None,
        };

        if old_manager != new_manager {
            row.manager = new_manager.clone();
            changed = true;
            cmw_db::record_change(
                &mut *tx,
                &cons_id,
                "manager",
                old_manager.as_deref(),
                new_manager.as_deref(),
                ChangeSource::Chat.as_str(),
            )
            .await?;

            let old_key = old_manager.as_deref().and_then(|s| Uuid::parse_str(s).ok());
            let new_key = new_manager.as_deref().and_then(|s| Uuid::parse_str(s).ok());
            if let Err(e) = cmw_notify::send_manager_reassignment(
                &st.pool,
                &mut *tx,
                st.chat.as_ref(),
                &row,
                old_key,
                new_key,
                "Reassigned in chat",
            )
            .await
            {
                warn!(cons_id, error = %e, "reassignment notice failed");
            }
            if new_manager.is_some() {
                if let Err(e) = cmw_notify::send_queue_update(
                    &st.pool,
                    &mut *tx,
                    st.chat.as_ref(),
                    &row,
                    new_manager.as_deref(),
                    Utc::now(),
                    st.settings.send_queue_wait_time_message,
                )
                .await
                {
                    warn!(cons_id, error = %e, "queue update notice failed");
                }
            }

            // Push to ERP on the background writer — never awaited here.
            if let (Some(ref_key), Some(manager_key)) = (row.cl_ref_key, new_key) {
                st.background.submit(ErpWrite::Manager {
                    cons_id: cons_id.clone(),
                    ref_key,
                    manager_key,
                });
            }
        }
    }

    // --- mirrored custom attributes ---------------------------------------
    if let Some(attrs) = &conversation.custom_attributes {
        changed |= apply_custom_attributes(&mut row, attrs);
    }

    if changed {
        cmw_db::update_consultation(&mut *tx, &row).await?;
        info!(cons_id, "consultation updated from chat webhook");
    }

    Ok(WebhookResponse::ok("Processed conversation.updated"))
}

// ---------------------------------------------------------------------------
// conversation.status_changed / conversation.resolved
// ---------------------------------------------------------------------------

async fn handle_status_changed(
    st: &Arc<AppState>,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    conversation: &WebhookConversation,
    event: &str,
) -> anyhow::Result<WebhookResponse> {
    let Some(id) = conversation.id else {
        return Ok(WebhookResponse::ok(format!("Processed {event} (no id)")));
    };
    let cons_id = id.to_string();

    let new_status_raw = conversation
        .status
        .as_ref()
        .and_then(|s| s.clone())
        .or_else(|| {
            (event == events::CONVERSATION_RESOLVED).then(|| "resolved".to_string())
        });
    let Some(new_status) = new_status_raw.as_deref().and_then(ConsStatus::parse) else {
        return Ok(WebhookResponse::ok(format!("Processed {event} (no status)")));
    };

    let Some(mut row) = cmw_db::find_by_cons_id(&mut *tx, &cons_id).await? else {
        return Ok(WebhookResponse::ok(format!("Processed {event} (unknown)")));
    };

    if new_status == row.status {
        return Ok(WebhookResponse::ok(format!("Processed {event} (unchanged)")));
    }
    if let Some(refusal) = refuse_client_closure(st, &row, new_status).await {
        return Ok(refusal);
    }

    apply_status_change(st, &mut *tx, &mut row, new_status, true).await?;
    cmw_db::update_consultation(&mut *tx, &row).await?;
    info!(cons_id, status = %new_status, "status updated from chat webhook");

    Ok(WebhookResponse::ok(format!("Processed {event}")))
}

// ---------------------------------------------------------------------------
// Shared pieces
// ---------------------------------------------------------------------------

/// Closing statuses a client may not set on an accounting consultation.
pub fn closure_refused(consultation_type: ConsultationType, new_status: ConsStatus) -> bool {
    consultation_type == ConsultationType::Accounting
        && matches!(new_status, ConsStatus::Resolved | ConsStatus::Closed)
}

/// Client-closure refusal: accounting consultations can only be closed from
/// the ERP side or by an operator. The previous status is pushed back to
/// chat and the store stays untouched.
async fn refuse_client_closure(
    st: &Arc<AppState>,
    row: &ConsultationRow,
    new_status: ConsStatus,
) -> Option<WebhookResponse> {
    if !closure_refused(row.consultation_type, new_status) {
        return None;
    }

    warn!(
        cons_id = %row.cons_id,
        from = %row.status,
        to = %new_status,
        "client attempted to close an accounting consultation; reverting"
    );

    if let Some(conversation_id) = ConsId::parse(&row.cons_id).chat_id() {
        let revert = cmw_chat::ConversationUpdate::status(row.status.as_str());
        if let Err(e) = st.chat.update_conversation(conversation_id, &revert).await {
            warn!(conversation_id, error = %e, "failed to revert conversation status");
        }
    }

    Some(WebhookResponse::ok(
        "Status change denied for accounting consultations",
    ))
}

/// Record and apply a chat-side status change; terminal transitions without
/// an end date stamp `now()` when `set_end_date` is on.
async fn apply_status_change(
    st: &Arc<AppState>,
    conn: &mut PgConnection,
    row: &mut ConsultationRow,
    new_status: ConsStatus,
    set_end_date: bool,
) -> anyhow::Result<()> {
    let old_status = row.status;
    row.status = new_status;
    if set_end_date && new_status.is_terminal() && row.end_date.is_none() {
        row.end_date = Some(Utc::now());
    }

    cmw_db::record_change(
        conn,
        &row.cons_id,
        "status",
        Some(old_status.as_str()),
        Some(new_status.as_str()),
        ChangeSource::Chat.as_str(),
    )
    .await?;

    if let Some(ref_key) = row.cl_ref_key {
        st.background.submit(ErpWrite::Status {
            cons_id: row.cons_id.clone(),
            ref_key,
            status: new_status,
        });
    }
    Ok(())
}

/// Lenient application of the mirrored custom-attribute subset.
fn apply_custom_attributes(
    row: &mut ConsultationRow,
    attrs: &serde_json::Map<String, Value>,
) -> bool {
    let mut changed = false;

    if let Some(value) = attrs.get("date_con") {
        if let Some(parsed) = cmw_mappers::lenient_datetime(value) {
            if row.start_date != Some(parsed) {
                row.start_date = Some(parsed);
                changed = true;
            }
        }
    }
    if let Some(value) = attrs.get("con_end") {
        if let Some(parsed) = cmw_mappers::lenient_datetime(value) {
            if row.end_date != Some(parsed) {
                row.end_date = Some(parsed);
                changed = true;
            }
        }
    }
    if let Some(value) = attrs.get("redate_con") {
        if let Some(parsed) = cmw_mappers::lenient_date(value) {
            if row.redate != Some(parsed) {
                row.redate = Some(parsed);
                changed = true;
            }
        }
    }
    if let Some(value) = attrs.get("retime_con") {
        if let Some(parsed) = cmw_mappers::lenient_time(value) {
            if row.redate_time != Some(parsed) {
                row.redate_time = Some(parsed);
                changed = true;
            }
        }
    }
    if let Some(value) = attrs.get("closed_without_con") {
        let denied = cmw_mappers::lenient_bool(value);
        if row.denied != denied {
            row.denied = denied;
            changed = true;
        }
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_row() -> ConsultationRow {
        ConsultationRow {
            cons_id: "42".to_string(),
            cl_ref_key: None,
            number: None,
            status: ConsStatus::Open,
            consultation_type: ConsultationType::Accounting,
            denied: false,
            create_date: Utc::now(),
            start_date: None,
            end_date: None,
            redate: None,
            redate_time: None,
            client_key: None,
            client_id: None,
            org_inn: None,
            manager: None,
            author: None,
            comment: None,
            online_question_cat: None,
            online_question: None,
            source: "CHAT".to_string(),
            con_blocks: None,
            con_calls: None,
            con_rates: None,
        }
    }

    #[test]
    fn custom_attributes_apply_leniently() {
        let mut row = base_row();
        let attrs = serde_json::json!({
            "date_con": "2025-03-02T10:00:00",
            "retime_con": "12:30",
            "closed_without_con": "true",
            "unrelated": 5
        });
        let changed = apply_custom_attributes(&mut row, attrs.as_object().unwrap());
        assert!(changed);
        assert!(row.start_date.is_some());
        assert_eq!(
            row.redate_time,
            chrono::NaiveTime::from_hms_opt(12, 30, 0)
        );
        assert!(row.denied);
    }

    #[test]
    fn custom_attributes_noop_when_equal() {
        let mut row = base_row();
        let attrs = serde_json::json!({ "retime_con": "12:30" });
        assert!(apply_custom_attributes(&mut row, attrs.as_object().unwrap()));
        assert!(!apply_custom_attributes(&mut row, attrs.as_object().unwrap()));
    }
}
