//! Reschedule puller (`ReschedRegister`).
//!
//! One consultation can be rescheduled many times; rows are insert-only on
//! `(cons_key, clients_key, manager_key, period)`. A newly inserted row
//! updates the consultation's `redate`/`redate_time`, fires the (deduped)
//! reschedule notification, and writes the new start date back to ERP. The
//! incremental buffer for this register is six hours.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::warn;

use cmw_odata::entities::RESCHED_REGISTER;
use cmw_odata::{filter_ge_datetime, ConsultationPatch, Query};
use cmw_schemas::ErpReschedule;

use crate::{EtlContext, EtlRun};

const SCRIPT: &str = "pull_reschedules";
const BUFFER_HOURS: i64 = 6;

pub async fn run(ctx: &EtlContext) -> Result<()> {
    let now = Utc::now();
    let checkpoint = cmw_db::load_checkpoint(&ctx.pool, RESCHED_REGISTER).await?;
    let from = cmw_db::effective_from(&checkpoint, now, chrono::Duration::hours(BUFFER_HOURS))
        .unwrap_or_else(|| ctx.initial_from());

    let mut run = EtlRun::start(
        SCRIPT,
        RESCHED_REGISTER,
        ctx.settings.max_error_logs,
        &[("from", from.to_rfc3339()), ("buffer_hours", BUFFER_HOURS.to_string())],
    );

    let mut cursor: Option<DateTime<Utc>> = checkpoint.last_synced_at.map(|t| t.min(now));
    let mut skip: i64 = 0;
    let mut batch_num: u64 = 0;

    loop {
        batch_num += 1;
        let query = Query {
            filter: Some(filter_ge_datetime("Period", &from)),
            orderby: Some("Period asc".to_string()),
            top: ctx.settings.page_size,
            skip,
        };

        let batch: Vec<ErpReschedule> =
            match ctx.odata.fetch_page(RESCHED_REGISTER, &query).await {
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
        let mut inserted: u64 = 0;
        let mut errors: u64 = 0;

        for item in &batch {
            match apply_reschedule(ctx, &mut tx, item).await {
                Ok(Some(period)) => {
                    inserted += 1;
                    cursor = crate::fold_cursor(cursor, period, now);
                }
                Ok(None) => {}
                Err(e) => {
                    errors += 1;
                    run.item_error(item.period.as_deref().unwrap_or("n/a"), &e);
                }
            }
        }

        if let Err(e) = tx.commit().await {
            run.batch_error(batch_num, skip, &e);
            run.finish(false);
            return Err(e).context("batch commit failed");
        }
        run.batch_progress(batch_num, batch_len, inserted, 0, errors);

        if let Some(cursor) = cursor {
            cmw_db::save_checkpoint(&ctx.pool, RESCHED_REGISTER, Some(cursor), None).await?;
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

async fn apply_reschedule(
    ctx: &EtlContext,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    item: &ErpReschedule,
) -> Result<Option<DateTime<Utc>>> {
    let Some(cons_key) = cmw_mappers::clean_uuid(item.consultation_key.as_deref()) else {
        return Ok(None);
    };
    let Some(period) = cmw_mappers::clean_datetime(item.period.as_deref()) else {
        return Ok(None);
    };

    let redate = cmw_db::NewRedate {
        cons_key,
        clients_key: cmw_mappers::clean_uuid(item.client_key.as_deref()),
        manager_key: cmw_mappers::clean_uuid(item.manager_key.as_deref()),
        period,
        old_date: cmw_mappers::clean_datetime(item.old_date.as_deref()),
        new_date: cmw_mappers::clean_datetime(item.new_date.as_deref()),
    };

    let is_new = cmw_db::insert_redate(&mut *tx, &redate).await?;

    if let Some(new_date) = redate.new_date {
        cmw_db::set_redate(
            &mut *tx,
            cons_key,
            new_date.date_naive(),
            new_date.time(),
        )
        .await?;
    }

    // Side effects only for rows we have not seen before; the notification
    // ledger additionally absorbs replays across crashes.
    if is_new {
        if let Some(consultation) = cmw_db::find_by_ref_key(&mut *tx, cons_key).await? {
            if let Some(new_date) = redate.new_date {
                if let Err(e) = cmw_notify::send_redate_notification(
                    &ctx.pool,
                    &mut *tx,
                    ctx.chat.as_ref(),
                    &consultation.cons_id,
                    redate.old_date,
                    new_date,
                    redate.manager_key,
                )
                .await
                {
                    warn!(cons_id = %consultation.cons_id, error = %e, "reschedule notice failed");
                }

                // Narrow ERP write: the consultation's new start date.
                let patch = ConsultationPatch {
                    start_date: Some(new_date),
                    ..Default::default()
                };
                if let Err(e) = ctx.odata.update_consultation(cons_key, &patch).await {
                    warn!(cons_key = %cons_key, error = %e, "failed to write new date back to ERP");
                }
            }
        }
    }

    Ok(Some(period))
}
