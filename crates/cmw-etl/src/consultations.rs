//! The consultation puller (pivot entity).
//!
//! Two modes:
//! - **incremental** (default): `ChangeDate >= cursor - buffer`, ascending,
//!   merge per record, fan out status flips and the custom-attribute mirror
//!   to chat, checkpoint per batch;
//! - **open-update**: re-query every non-terminal `cl_ref_key` in key
//!   batches sized under the URL-length limit; a key the ERP no longer
//!   returns is treated as deleted — cancelled locally, resolved in chat,
//!   with an explanatory message, exactly once.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use sqlx::PgConnection;
use tracing::{debug, warn};
use uuid::Uuid;

use cmw_chat::ConversationUpdate;
use cmw_config::EtlMode;
use cmw_odata::entities::CONSULTATION_DOC;
use cmw_odata::{filter_ge_datetime, filter_ref_key_batch, Query};
use cmw_schemas::{ChangeSource, ConsStatus, ErpConsultation};

use crate::merge::{self, StatusFanout};
use crate::{EtlContext, EtlRun};

const SCRIPT: &str = "pull_consultations";

pub async fn run(ctx: &EtlContext) -> Result<()> {
    match ctx.settings.etl_mode {
        EtlMode::Incremental => run_incremental(ctx).await,
        EtlMode::OpenUpdate => run_open_update(ctx).await,
    }
}

// ---------------------------------------------------------------------------
// Incremental mode
// ---------------------------------------------------------------------------

pub async fn run_incremental(ctx: &EtlContext) -> Result<()> {
    let now = Utc::now();
    let buffer = chrono::Duration::days(ctx.settings.incremental_buffer_days);
    let checkpoint = cmw_db::load_checkpoint(&ctx.pool, CONSULTATION_DOC).await?;
    let from = cmw_db::effective_from(&checkpoint, now, buffer).unwrap_or_else(|| ctx.initial_from());

    let mut run = EtlRun::start(
        SCRIPT,
        CONSULTATION_DOC,
        ctx.settings.max_error_logs,
        &[
            ("mode", "incremental".to_string()),
            ("from", from.to_rfc3339()),
            ("buffer_days", ctx.settings.incremental_buffer_days.to_string()),
            ("page_size", ctx.settings.page_size.to_string()),
        ],
    );

    // The cursor only ever moves forward and never past "now": a scheduled
    // consultation with a future change date must not pin it ahead.
    let mut cursor: Option<DateTime<Utc>> = checkpoint.last_synced_at.map(|t| t.min(now));
    let mut skip: i64 = 0;
    let mut batch_num: u64 = 0;

    loop {
        batch_num += 1;
        let query = Query {
            filter: Some(filter_ge_datetime("ChangeDate", &from)),
            orderby: Some("ChangeDate asc".to_string()),
            top: ctx.settings.page_size,
            skip,
        };

        let batch: Vec<ErpConsultation> =
            match ctx.odata.fetch_page(CONSULTATION_DOC, &query).await {
                Ok(batch) => batch,
                Err(e) if e.is_bad_request() => {
                    // A 400 on the filter string is an encoding regression,
                    // not an upstream hiccup: stop the process.
                    run.batch_error(batch_num, skip, &e);
                    run.finish(false);
                    return Err(anyhow::anyhow!(e)).context("OData rejected the filter (400)");
                }
                Err(e) => {
                    run.batch_error(batch_num, skip, &e);
                    break;
                }
            };

        if batch.is_empty() {
            break;
        }
        let batch_len = batch.len();

        let mut tx = ctx.pool.begin().await.context("begin batch tx")?;
        let mut created: u64 = 0;
        let mut updated: u64 = 0;
        let mut errors: u64 = 0;

        for record in &batch {
            match apply_record(ctx, &mut tx, record, now).await {
                Ok(outcome) => {
                    if outcome.created {
                        created += 1;
                    } else {
                        updated += 1;
                    }
                    cursor = crate::fold_cursor(cursor, outcome.cursor_date, now);
                }
                Err(e) => {
                    errors += 1;
                    run.item_error(record.ref_key.as_deref().unwrap_or("n/a"), &e);
                }
            }
        }

        if let Err(e) = tx.commit().await {
            // The checkpoint is unchanged, so the batch reruns on restart.
            run.batch_error(batch_num, skip, &e);
            run.finish(false);
            return Err(e).context("batch commit failed");
        }
        run.batch_progress(batch_num, batch_len, created, updated, errors);

        if let Some(cursor) = cursor {
            cmw_db::save_checkpoint(&ctx.pool, CONSULTATION_DOC, Some(cursor), None).await?;
            run.checkpoint_saved(&cursor.to_rfc3339(), Some(batch_num));
        }

        if (batch_len as i64) < ctx.settings.page_size {
            break;
        }
        skip += ctx.settings.page_size;
    }

    run.finish(true);
    Ok(())
}

/// Merge one record into the store and fan out its side effects on the batch
/// connection. Chat failures are demoted to warnings inside.
async fn apply_record(
    ctx: &EtlContext,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    record: &ErpConsultation,
    now: DateTime<Utc>,
) -> Result<merge::MergeOutcome> {
    let conn: &mut PgConnection = &mut *tx;

    let ref_key = cmw_mappers::clean_uuid(record.ref_key.as_deref())
        .ok_or_else(|| anyhow::anyhow!(merge::MergeError::MissingRefKey))?;
    let existing = cmw_db::find_by_ref_key(conn, ref_key).await?;

    let mut outcome = merge::merge_consultation(existing.as_ref(), record, now, false)
        .map_err(|e| anyhow::anyhow!(e))?;

    // A brand-new queued consultation with no operator goes through the
    // selection engine before it lands in the store.
    let mut selected_by_engine = false;
    if outcome.created && outcome.row.manager.is_none() && outcome.row.status == ConsStatus::Pending
    {
        let mut rng = StdRng::from_entropy();
        let routing = cmw_selector::RoutingContext {
            category_key: outcome
                .row
                .online_question_cat
                .as_deref()
                .and_then(|s| Uuid::parse_str(s).ok()),
            po_section_key: None,
            language: None,
        };
        match cmw_selector::select_operator(
            &mut *tx,
            outcome.row.consultation_type,
            &routing,
            now,
            ctx.settings.business_tz,
            &mut rng,
        )
        .await
        {
            Ok(Some(operator)) => {
                outcome.row.manager = Some(operator.to_string());
                outcome.manager_change = Some(merge::ManagerChange {
                    old: None,
                    new: operator.to_string(),
                });
                selected_by_engine = true;
            }
            Ok(None) => {}
            Err(e) => warn!(cons_id = %outcome.row.cons_id, error = %e, "operator selection failed"),
        }
    }

    // An unchanged record is a complete no-op: no Q&A rebuild, no writes,
    // no fan-out. This is what makes replaying a batch free.
    if !outcome.created && !outcome.changed {
        return Ok(outcome);
    }

    // Q&A rows are rebuilt from scratch for each pulled consultation.
    let qa = merge::qa_rows(record);
    cmw_db::rebuild_q_and_a(&mut *tx, ref_key, &outcome.row.cons_id, &qa).await?;

    // Aggregates are recomputed, never maintained incrementally.
    let con_blocks = cmw_db::first_block_key(&mut *tx, ref_key).await?;
    let con_calls = cmw_db::calls_aggregate(&mut *tx, ref_key).await?;
    let mut aggregates_changed = false;
    if con_blocks.is_some() && outcome.row.con_blocks != con_blocks {
        outcome.row.con_blocks = con_blocks;
        aggregates_changed = true;
    }
    if con_calls.is_some() && outcome.row.con_calls != con_calls {
        outcome.row.con_calls = con_calls;
        aggregates_changed = true;
    }

    if outcome.created {
        cmw_db::insert_consultation(&mut *tx, &outcome.row).await?;
    } else if outcome.changed || aggregates_changed {
        cmw_db::update_consultation(&mut *tx, &outcome.row).await?;
    }

    // Audit trail for the tracked fields, tagged with the ERP origin.
    if let Some((old, new)) = outcome.status_change {
        cmw_db::record_change(
            &mut *tx,
            &outcome.row.cons_id,
            "status",
            Some(old.as_str()),
            Some(new.as_str()),
            ChangeSource::Erp.as_str(),
        )
        .await?;
    }
    if let Some(change) = &outcome.manager_change {
        let origin = if selected_by_engine {
            ChangeSource::Etl
        } else {
            ChangeSource::Erp
        };
        cmw_db::record_change(
            &mut *tx,
            &outcome.row.cons_id,
            "manager",
            change.old.as_deref(),
            Some(&change.new),
            origin.as_str(),
        )
        .await?;

        // An engine-selected operator originated outside ERP, so it is the
        // one manager change a pull pushes back through the narrow write
        // path. Best effort — the change-log row stays unsynced on failure.
        if selected_by_engine {
            if let Ok(manager_key) = Uuid::parse_str(&change.new) {
                let patch = cmw_odata::ConsultationPatch {
                    manager_key: Some(manager_key),
                    ..Default::default()
                };
                match ctx.odata.update_consultation(ref_key, &patch).await {
                    Ok(()) => {
                        cmw_db::mark_change_synced_to_erp(&mut *tx, &outcome.row.cons_id, "manager")
                            .await?;
                    }
                    Err(e) => {
                        warn!(cons_id = %outcome.row.cons_id, error = %e, "failed to push selected operator to ERP");
                    }
                }
            }
        }
    }

    fan_out_to_chat(ctx, &mut *tx, &outcome).await;

    Ok(outcome)
}

/// Status flips, the custom-attribute mirror, and reassignment notices.
/// Everything here is best-effort: failures are logged and the pull goes on.
async fn fan_out_to_chat(
    ctx: &EtlContext,
    conn: &mut PgConnection,
    outcome: &merge::MergeOutcome,
) {
    let row = &outcome.row;
    let Some(conversation_id) = row.id().chat_id() else {
        debug!(cons_id = %row.cons_id, "no chat id yet, skipping chat sync");
        return;
    };

    let mut status_synced = false;
    match &outcome.fanout {
        Some(StatusFanout::Close {
            duration_minutes,
            end_date,
        }) => {
            match cmw_notify::send_status_close(
                &ctx.pool,
                ctx.chat.as_ref(),
                &row.cons_id,
                *duration_minutes,
                *end_date,
            )
            .await
            {
                Ok(()) => status_synced = true,
                Err(e) => warn!(conversation_id, error = %e, "close fan-out failed"),
            }
        }
        Some(StatusFanout::SetOpen) => {
            match ctx
                .chat
                .update_conversation(conversation_id, &ConversationUpdate::status("open"))
                .await
            {
                Ok(()) => status_synced = true,
                Err(e) => warn!(conversation_id, error = %e, "failed to reopen conversation"),
            }
        }
        Some(StatusFanout::SetPending) => {
            match ctx
                .chat
                .update_conversation(conversation_id, &ConversationUpdate::status("pending"))
                .await
            {
                Ok(()) => status_synced = true,
                Err(e) => warn!(conversation_id, error = %e, "failed to set conversation pending"),
            }
        }
        None => {}
    }

    // Audit pointer: the status change has been pushed to the chat side.
    if status_synced {
        if let Err(e) = cmw_db::mark_change_synced_to_chat(&mut *conn, &row.cons_id, "status").await
        {
            warn!(conversation_id, error = %e, "failed to mark status change as chat-synced");
        }
    }

    // Mirror the fixed field subset into conversation custom attributes.
    let mirror = merge::build_mirror(row);
    if !mirror.is_empty() {
        if let Err(e) = ctx
            .chat
            .update_conversation_custom_attributes(conversation_id, &mirror.to_patch())
            .await
        {
            warn!(conversation_id, error = %e, "custom-attribute mirror failed");
        }
    }

    if let Some(change) = &outcome.manager_change {
        let old_key = change.old.as_deref().and_then(|s| Uuid::parse_str(s).ok());
        let new_key = Uuid::parse_str(&change.new).ok();
        if let Err(e) = cmw_notify::send_manager_reassignment(
            &ctx.pool,
            conn,
            ctx.chat.as_ref(),
            row,
            old_key,
            new_key,
            "Reassigned in ERP",
        )
        .await
        {
            warn!(conversation_id, error = %e, "reassignment notice failed");
        }
        if let Err(e) = cmw_notify::send_queue_update(
            &ctx.pool,
            conn,
            ctx.chat.as_ref(),
            row,
            Some(change.new.as_str()),
            Utc::now(),
            ctx.settings.send_queue_wait_time_message,
        )
        .await
        {
            warn!(conversation_id, error = %e, "queue update notice failed");
        }
        // The change originated in ERP, so there is nothing to write back —
        // the ERP write path only fires for changes recorded from the chat
        // side (see the webhook reconciler).
    }
}

// ---------------------------------------------------------------------------
// Open-update mode
// ---------------------------------------------------------------------------

pub async fn run_open_update(ctx: &EtlContext) -> Result<()> {
    let now = Utc::now();

    let open_keys = {
        let mut conn = ctx.pool.acquire().await?;
        cmw_db::nonterminal_ref_keys(&mut conn).await?
    };

    let mut run = EtlRun::start(
        SCRIPT,
        CONSULTATION_DOC,
        ctx.settings.max_error_logs,
        &[
            ("mode", "open_update".to_string()),
            ("open_consultations", open_keys.len().to_string()),
            ("keys_per_request", ctx.settings.max_keys_per_request.to_string()),
        ],
    );

    if open_keys.is_empty() {
        run.finish(true);
        return Ok(());
    }

    let chunk_size = ctx.settings.max_keys_per_request.max(1);
    let mut batch_num: u64 = 0;

    for chunk in open_keys.chunks(chunk_size) {
        batch_num += 1;
        let query = Query {
            filter: Some(filter_ref_key_batch(chunk)),
            orderby: None,
            top: ctx.settings.page_size,
            skip: 0,
        };

        let batch: Vec<ErpConsultation> =
            match ctx.odata.fetch_page(CONSULTATION_DOC, &query).await {
                Ok(batch) => batch,
                Err(e) => {
                    run.batch_error(batch_num, 0, &e);
                    continue;
                }
            };

        let mut tx = match ctx.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                run.batch_error(batch_num, 0, &e);
                continue;
            }
        };

        let mut created: u64 = 0;
        let mut updated: u64 = 0;
        let mut errors: u64 = 0;
        let mut returned: Vec<Uuid> = Vec::with_capacity(batch.len());

        for record in &batch {
            match apply_record(ctx, &mut tx, record, now).await {
                Ok(outcome) => {
                    returned.push(outcome.ref_key);
                    if outcome.created {
                        created += 1;
                    } else {
                        updated += 1;
                    }
                }
                Err(e) => {
                    errors += 1;
                    run.item_error(record.ref_key.as_deref().unwrap_or("n/a"), &e);
                }
            }
        }

        // A key that was queried but not returned no longer exists in ERP.
        for missing in chunk.iter().filter(|k| !returned.contains(k)) {
            if let Err(e) = cancel_deleted(ctx, &mut tx, *missing).await {
                errors += 1;
                run.item_error(&missing.to_string(), &e);
            }
        }

        match tx.commit().await {
            Ok(()) => run.batch_progress(batch_num, batch.len(), created, updated, errors),
            Err(e) => run.batch_error(batch_num, 0, &e),
        }
    }

    run.finish(true);
    Ok(())
}

/// Mark a consultation deleted in ERP: cancel it locally and resolve the
/// conversation with an explanation — once; the ledger absorbs replays.
async fn cancel_deleted(
    ctx: &EtlContext,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ref_key: Uuid,
) -> Result<()> {
    let Some(consultation) = cmw_db::find_by_ref_key(&mut *tx, ref_key).await? else {
        return Ok(());
    };
    if consultation.status.is_terminal() {
        return Ok(());
    }

    cmw_db::set_status(&mut *tx, &consultation.cons_id, ConsStatus::Cancelled).await?;
    cmw_db::record_change(
        &mut *tx,
        &consultation.cons_id,
        "status",
        Some(consultation.status.as_str()),
        Some(ConsStatus::Cancelled.as_str()),
        ChangeSource::Erp.as_str(),
    )
    .await?;

    if let Err(e) =
        cmw_notify::send_deleted_close(&ctx.pool, ctx.chat.as_ref(), &consultation.cons_id).await
    {
        warn!(cons_id = %consultation.cons_id, error = %e, "deleted-close notice failed");
    }
    Ok(())
}
