//! Dial-attempt puller (`CallRegister`).
//!
//! Insert-only rows keyed `(period, cons_key, manager)`; conflicts are
//! ignored, so replays are free.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use cmw_odata::entities::CALL_REGISTER;
use cmw_odata::{filter_ge_datetime, Query};
use cmw_schemas::ErpCall;

use crate::{EtlContext, EtlRun};

const SCRIPT: &str = "pull_calls";

pub async fn run(ctx: &EtlContext) -> Result<()> {
    let now = Utc::now();
    let buffer = chrono::Duration::days(ctx.settings.incremental_buffer_days);
    let checkpoint = cmw_db::load_checkpoint(&ctx.pool, CALL_REGISTER).await?;
    let from = cmw_db::effective_from(&checkpoint, now, buffer).unwrap_or_else(|| ctx.initial_from());

    let mut run = EtlRun::start(
        SCRIPT,
        CALL_REGISTER,
        ctx.settings.max_error_logs,
        &[("from", from.to_rfc3339())],
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

        let batch: Vec<ErpCall> = match ctx.odata.fetch_page(CALL_REGISTER, &query).await {
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
            match apply_call(&mut tx, item).await {
                Ok(Some(period)) => {
                    inserted += 1;
                    cursor = crate::fold_cursor(cursor, period, now);
                }
                Ok(None) => {
                    // Missing required fields or an already-known attempt.
                }
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
            cmw_db::save_checkpoint(&ctx.pool, CALL_REGISTER, Some(cursor), None).await?;
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

/// Returns the period when a usable row was processed (inserted or already
/// present), `None` when required fields are missing.
async fn apply_call(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    item: &ErpCall,
) -> Result<Option<DateTime<Utc>>> {
    let conn: &mut PgConnection = &mut *tx;

    let Some(period) = cmw_mappers::clean_datetime(item.period.as_deref()) else {
        return Ok(None);
    };
    let Some(cons_key) = cmw_mappers::clean_uuid(item.consultation_key.as_deref()) else {
        return Ok(None);
    };

    // Enrich with the consultation's chat id when we already know it.
    let cons_id = cmw_db::find_by_ref_key(conn, cons_key)
        .await?
        .map(|c| c.cons_id);

    let call = cmw_db::NewCall {
        period,
        cons_key,
        cons_id,
        client_key: cmw_mappers::clean_uuid(item.client_key.as_deref()),
        client_id: None,
        manager: cmw_mappers::clean_uuid(item.manager_key.as_deref()),
    };
    cmw_db::insert_call(&mut *tx, &call).await?;
    Ok(Some(period))
}
