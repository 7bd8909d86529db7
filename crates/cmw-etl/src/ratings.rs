//! Rating puller (`RatingRegister`).
//!
//! The source's `RatingDate` is frequently unfilled, so this entity cursors
//! on the consultation key instead: records come back in ascending key order
//! and a row is skipped only when its key strictly precedes the stored
//! `last_synced_key`. GUIDs are never compared with gt/lt in the filter —
//! the skip happens in-process on the textual key.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use cmw_odata::entities::RATING_REGISTER;
use cmw_odata::Query;
use cmw_schemas::ErpRating;

use crate::{EtlContext, EtlRun};

const SCRIPT: &str = "pull_ratings";

pub async fn run(ctx: &EtlContext) -> Result<()> {
    let now = Utc::now();
    let checkpoint = cmw_db::load_checkpoint(&ctx.pool, RATING_REGISTER).await?;
    let last_synced_key = checkpoint.last_synced_key.clone();

    let mut run = EtlRun::start(
        SCRIPT,
        RATING_REGISTER,
        ctx.settings.max_error_logs,
        &[(
            "last_synced_key",
            last_synced_key.clone().unwrap_or_else(|| "none".to_string()),
        )],
    );

    let mut max_key: Option<String> = last_synced_key.clone();
    let mut max_date: Option<DateTime<Utc>> = checkpoint.last_synced_at;
    let mut skip: i64 = 0;
    let mut batch_num: u64 = 0;

    loop {
        batch_num += 1;
        let query = Query {
            filter: None,
            orderby: Some("Consultation_Key asc".to_string()),
            top: ctx.settings.page_size,
            skip,
        };

        let batch: Vec<ErpRating> = match ctx.odata.fetch_page(RATING_REGISTER, &query).await {
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
        let mut updated: u64 = 0;
        let mut errors: u64 = 0;
        let mut affected: Vec<Uuid> = Vec::new();

        for item in &batch {
            let Some(cons_key) = cmw_mappers::clean_uuid(item.consultation_key.as_deref()) else {
                continue;
            };
            let key_text = cons_key.to_string();

            // Textual UUID comparison is stable; skip everything strictly
            // before the cursor.
            if let Some(cursor_key) = &last_synced_key {
                if key_text.as_str() < cursor_key.as_str() {
                    continue;
                }
            }

            let Some(question_number) = item.question_number else {
                continue;
            };

            match apply_rating(ctx, &mut tx, item, cons_key, question_number).await {
                Ok(was_inserted) => {
                    if was_inserted {
                        inserted += 1;
                    } else {
                        updated += 1;
                    }
                    if !affected.contains(&cons_key) {
                        affected.push(cons_key);
                    }
                    if max_key.as_deref().map(|k| key_text.as_str() > k).unwrap_or(true) {
                        max_key = Some(key_text);
                    }
                    if let Some(dt) = cmw_mappers::clean_datetime(item.rating_date.as_deref()) {
                        if max_date.map(|d| dt > d).unwrap_or(true) {
                            max_date = Some(dt);
                        }
                    }
                }
                Err(e) => {
                    errors += 1;
                    run.item_error(&cons_key.to_string(), &e);
                }
            }
        }

        // The aggregate is materialized, not maintained: recompute once per
        // affected parent after the batch.
        for cons_key in &affected {
            if let Err(e) = cmw_db::recalc_con_rates(&mut tx, *cons_key).await {
                errors += 1;
                run.item_error(&cons_key.to_string(), &e);
            }
        }

        if let Err(e) = tx.commit().await {
            run.batch_error(batch_num, skip, &e);
            run.finish(false);
            return Err(e).context("batch commit failed");
        }
        run.batch_progress(batch_num, batch_len, inserted, updated, errors);

        if max_key.is_some() {
            cmw_db::save_checkpoint(
                &ctx.pool,
                RATING_REGISTER,
                max_date.map(|d| d.min(now)),
                max_key.as_deref(),
            )
            .await?;
            run.checkpoint_saved(max_key.as_deref().unwrap_or("none"), Some(batch_num));
        }

        if (batch_len as i64) < ctx.settings.page_size {
            break;
        }
        skip += ctx.settings.page_size;
    }

    run.finish(true);
    Ok(())
}

/// Upsert one answer row; a newly inserted row fires the rating notification
/// when the parent consultation has a chat identity.
async fn apply_rating(
    ctx: &EtlContext,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    item: &ErpRating,
    cons_key: Uuid,
    question_number: i64,
) -> Result<bool> {
    let consultation = cmw_db::find_by_ref_key(&mut *tx, cons_key).await?;
    let cons_id = consultation.as_ref().map(|c| c.cons_id.clone());
    let client_id = consultation.as_ref().and_then(|c| c.client_id.clone());

    let answer = cmw_db::RatingAnswerRow {
        cons_key,
        cons_id: cons_id.clone(),
        client_key: cmw_mappers::clean_uuid(item.client_key.as_deref()),
        client_id,
        manager_key: cmw_mappers::clean_uuid(item.manager_key.as_deref()),
        question_number,
        rating: item.rating,
        question_text: item.question_text.clone(),
        comment: item.comment.clone(),
        sent_to_base: item.sent_to_base,
        rating_date: cmw_mappers::clean_datetime(item.rating_date.as_deref()),
    };

    let is_new = cmw_db::upsert_rating_answer(&mut *tx, &answer).await?;

    if is_new {
        if let (Some(cons_id), Some(rating)) = (cons_id, answer.rating) {
            if let Err(e) = cmw_notify::send_rating_notification(
                &ctx.pool,
                &mut *tx,
                ctx.chat.as_ref(),
                &cons_id,
                rating,
                answer.question_text.as_deref(),
                answer.manager_key,
            )
            .await
            {
                warn!(cons_id, error = %e, "rating notice failed");
            }
        }
    }

    Ok(is_new)
}
