//! Queue-closing puller (`QueueClosingRegister`).
//!
//! One register row closes one operator's queue for exactly one day. Only
//! rows dated today are materialized; `Closed=false` reopens the queue by
//! deleting the row. A fresh closure warns every active consultation of that
//! operator that it will be reassigned. The incremental buffer is one day.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use cmw_odata::entities::QUEUE_CLOSING_REGISTER;
use cmw_odata::{filter_ge_datetime, Query};
use cmw_schemas::ErpQueueClosing;

use crate::{EtlContext, EtlRun};

const SCRIPT: &str = "pull_queue_closings";

pub async fn run(ctx: &EtlContext) -> Result<()> {
    let now = Utc::now();
    let today = now.with_timezone(&ctx.settings.business_tz).date_naive();
    let checkpoint = cmw_db::load_checkpoint(&ctx.pool, QUEUE_CLOSING_REGISTER).await?;
    let from = cmw_db::effective_from(&checkpoint, now, chrono::Duration::days(1))
        .unwrap_or_else(|| ctx.initial_from());

    let mut run = EtlRun::start(
        SCRIPT,
        QUEUE_CLOSING_REGISTER,
        ctx.settings.max_error_logs,
        &[("from", from.to_rfc3339()), ("today", today.to_string())],
    );

    let mut cursor: Option<DateTime<Utc>> = checkpoint.last_synced_at.map(|t| t.min(now));
    let mut skip: i64 = 0;
    let mut batch_num: u64 = 0;

    loop {
        batch_num += 1;
        let query = Query {
            filter: Some(filter_ge_datetime("Date", &from)),
            orderby: Some("Date asc".to_string()),
            top: ctx.settings.page_size,
            skip,
        };

        let batch: Vec<ErpQueueClosing> =
            match ctx.odata.fetch_page(QUEUE_CLOSING_REGISTER, &query).await {
                Ok(batch) => batch,
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
        let mut applied: u64 = 0;
        let mut errors: u64 = 0;

        for item in &batch {
            match apply_closing(ctx, &mut tx, item, today).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    errors += 1;
                    run.item_error(item.manager_key.as_deref().unwrap_or("n/a"), &e);
                }
            }
            // Cursor follows the register date, clamped to now.
            if let Some(date) = cmw_mappers::clean_datetime(item.date.as_deref()) {
                cursor = crate::fold_cursor(cursor, date, now);
            }
        }

        if let Err(e) = tx.commit().await {
            run.batch_error(batch_num, skip, &e);
            run.finish(false);
            return Err(e).context("batch commit failed");
        }
        run.batch_progress(batch_num, batch_len, applied, 0, errors);

        if let Some(cursor) = cursor {
            cmw_db::save_checkpoint(&ctx.pool, QUEUE_CLOSING_REGISTER, Some(cursor), None).await?;
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

async fn apply_closing(
    ctx: &EtlContext,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    item: &ErpQueueClosing,
    today: chrono::NaiveDate,
) -> Result<()> {
    let Some(date) = cmw_mappers::clean_datetime(item.date.as_deref()) else {
        return Ok(());
    };
    let Some(manager_key) = cmw_mappers::clean_uuid(item.manager_key.as_deref()) else {
        return Ok(());
    };

    // A closure acts on exactly one day; only today's rows are materialized.
    let day = date.with_timezone(&ctx.settings.business_tz).date_naive();
    if day != today {
        return Ok(());
    }

    if !item.closed {
        cmw_db::delete_queue_closing(&mut *tx, day, manager_key).await?;
        return Ok(());
    }

    let is_new = cmw_db::upsert_queue_closing(&mut *tx, day, manager_key).await?;
    if is_new {
        notify_closure(ctx, tx, manager_key, day).await?;
    }
    Ok(())
}

/// Tell every active client of the operator that their consultation will be
/// reassigned.
async fn notify_closure(
    ctx: &EtlContext,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    manager_key: Uuid,
    day: chrono::NaiveDate,
) -> Result<()> {
    let manager_name = cmw_db::user_display_name(&mut *tx, manager_key)
        .await?
        .unwrap_or_else(|| "your operator".to_string());

    let consultations =
        cmw_db::active_consultations_of_manager(&mut *tx, &manager_key.to_string()).await?;

    for consultation in consultations {
        if let Err(e) = cmw_notify::send_queue_closed_notice(
            &ctx.pool,
            ctx.chat.as_ref(),
            &consultation.cons_id,
            manager_key,
            &manager_name,
            day,
        )
        .await
        {
            warn!(cons_id = %consultation.cons_id, error = %e, "queue-closed notice failed");
        }
    }
    Ok(())
}
