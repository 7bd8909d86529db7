//! Bulk consultation puller ("all" variant).
//!
//! Same source entity as the main puller but without the client-ownership
//! filter, cursored on `CreateDate` under its own checkpoint name. The rows
//! exist purely so the queue engine can count load from consultations not
//! owned by this tenant: `cl_all_` ids, `ERP_ALL` source, no chat fan-out,
//! no Q&A.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use cmw_odata::entities::{CONSULTATION_DOC, CONSULTATION_DOC_ALL};
use cmw_odata::{filter_ge_datetime, Query};
use cmw_schemas::ErpConsultation;

use crate::merge;
use crate::{EtlContext, EtlRun};

const SCRIPT: &str = "pull_all_consultations";

pub async fn run(ctx: &EtlContext) -> Result<()> {
    let now = Utc::now();
    let buffer = chrono::Duration::days(ctx.settings.incremental_buffer_days);
    let checkpoint = cmw_db::load_checkpoint(&ctx.pool, CONSULTATION_DOC_ALL).await?;
    let from = cmw_db::effective_from(&checkpoint, now, buffer).unwrap_or_else(|| ctx.initial_from());

    let mut run = EtlRun::start(
        SCRIPT,
        CONSULTATION_DOC_ALL,
        ctx.settings.max_error_logs,
        &[
            ("from", from.to_rfc3339()),
            ("page_size", ctx.settings.page_size.to_string()),
        ],
    );

    let mut cursor: Option<DateTime<Utc>> = checkpoint.last_synced_at.map(|t| t.min(now));
    let mut skip: i64 = 0;
    let mut batch_num: u64 = 0;

    loop {
        batch_num += 1;
        let query = Query {
            filter: Some(filter_ge_datetime("CreateDate", &from)),
            orderby: Some("CreateDate asc".to_string()),
            top: ctx.settings.page_size,
            skip,
        };

        let batch: Vec<ErpConsultation> =
            match ctx.odata.fetch_page(CONSULTATION_DOC, &query).await {
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
        let mut created: u64 = 0;
        let mut updated: u64 = 0;
        let mut errors: u64 = 0;

        for record in &batch {
            match apply_bulk_record(&mut tx, record, now).await {
                Ok((was_created, observed)) => {
                    if was_created {
                        created += 1;
                    } else {
                        updated += 1;
                    }
                    cursor = crate::fold_cursor(cursor, observed, now);
                }
                Err(e) => {
                    errors += 1;
                    run.item_error(record.ref_key.as_deref().unwrap_or("n/a"), &e);
                }
            }
        }

        if let Err(e) = tx.commit().await {
            run.batch_error(batch_num, skip, &e);
            run.finish(false);
            return Err(e).context("batch commit failed");
        }
        run.batch_progress(batch_num, batch_len, created, updated, errors);

        if let Some(cursor) = cursor {
            cmw_db::save_checkpoint(&ctx.pool, CONSULTATION_DOC_ALL, Some(cursor), None).await?;
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

async fn apply_bulk_record(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    record: &ErpConsultation,
    now: DateTime<Utc>,
) -> Result<(bool, DateTime<Utc>)> {
    let conn: &mut PgConnection = &mut *tx;

    let ref_key = cmw_mappers::clean_uuid(record.ref_key.as_deref())
        .ok_or_else(|| anyhow::anyhow!(merge::MergeError::MissingRefKey))?;
    let existing = cmw_db::find_by_ref_key(conn, ref_key).await?;

    let outcome = merge::merge_consultation(existing.as_ref(), record, now, true)
        .map_err(|e| anyhow::anyhow!(e))?;

    if outcome.created {
        cmw_db::insert_consultation(&mut *tx, &outcome.row).await?;
    } else if outcome.changed {
        cmw_db::update_consultation(&mut *tx, &outcome.row).await?;
    }

    Ok((outcome.created, outcome.cursor_date))
}
