//! Notification ledger, change log, webhook log.

use anyhow::{Context, Result};
use sqlx::{PgConnection, PgPool, Row};

// ---------------------------------------------------------------------------
// Notification ledger (sys.notification_log)
// ---------------------------------------------------------------------------

/// Check-and-record for an outbound side-effect message.
///
/// Returns true when the hash was already recorded (the message must not be
/// sent again) and false when this call recorded it (send now).
///
/// Takes the pool, not the batch connection: the insert commits on its own
/// connection, so a later rollback of the pull batch cannot "un-send" the
/// record. Conversely, a failed send after recording is accepted as the
/// at-most-once trade-off.
pub async fn check_and_record_notification(
    pool: &PgPool,
    notification_type: &str,
    entity_id: &str,
    unique_hash: &str,
) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        insert into sys.notification_log (notification_type, entity_id, unique_hash)
        values ($1, $2, $3)
        on conflict (unique_hash) do nothing
        returning id
        "#,
    )
    .bind(notification_type)
    .bind(entity_id)
    .bind(unique_hash)
    .fetch_optional(pool)
    .await
    .context("check_and_record_notification failed")?;

    // No row back means the conflict fired: already sent.
    Ok(row.is_none())
}

/// Best-effort compensation when a send fails after its hash was recorded:
/// the key is removed so a later run retries the fan-out.
pub async fn remove_notification(pool: &PgPool, unique_hash: &str) -> Result<()> {
    sqlx::query("delete from sys.notification_log where unique_hash = $1")
        .bind(unique_hash)
        .execute(pool)
        .await
        .context("remove_notification failed")?;
    Ok(())
}

/// Read-only probe, for tests and diagnostics.
pub async fn notification_recorded(pool: &PgPool, unique_hash: &str) -> Result<bool> {
    let row = sqlx::query("select 1 as one from sys.notification_log where unique_hash = $1")
        .bind(unique_hash)
        .fetch_optional(pool)
        .await
        .context("notification_recorded failed")?;
    Ok(row.is_some())
}

// ---------------------------------------------------------------------------
// Change log (sys.cons_change_log)
// ---------------------------------------------------------------------------

/// Append one field mutation with its origin tag.
pub async fn record_change(
    conn: &mut PgConnection,
    cons_id: &str,
    field_name: &str,
    old_value: Option<&str>,
    new_value: Option<&str>,
    source: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into sys.cons_change_log (cons_id, field_name, old_value, new_value, source)
        values ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(cons_id)
    .bind(field_name)
    .bind(old_value)
    .bind(new_value)
    .bind(source)
    .execute(conn)
    .await
    .context("record_change failed")?;
    Ok(())
}

async fn mark_latest_change(
    conn: &mut PgConnection,
    cons_id: &str,
    field_name: &str,
    column: &str,
) -> Result<()> {
    let sql = format!(
        r#"
        update sys.cons_change_log
           set {column} = true
         where id = (
            select id from sys.cons_change_log
            where cons_id = $1 and field_name = $2
            order by created_at desc, id desc
            limit 1
         )
        "#
    );
    sqlx::query(&sql)
        .bind(cons_id)
        .bind(field_name)
        .execute(conn)
        .await
        .with_context(|| format!("mark change {column} failed"))?;
    Ok(())
}

/// Flip `synced_to_erp` on the most recent log row for `(cons_id, field)`.
pub async fn mark_change_synced_to_erp(
    conn: &mut PgConnection,
    cons_id: &str,
    field_name: &str,
) -> Result<()> {
    mark_latest_change(conn, cons_id, field_name, "synced_to_erp").await
}

/// Flip `synced_to_chat` on the most recent log row for `(cons_id, field)`.
pub async fn mark_change_synced_to_chat(
    conn: &mut PgConnection,
    cons_id: &str,
    field_name: &str,
) -> Result<()> {
    mark_latest_change(conn, cons_id, field_name, "synced_to_chat").await
}

/// Origin of the most recent recorded change of a field, used to avoid
/// pushing a change back to the side it came from.
pub async fn last_change_source(
    conn: &mut PgConnection,
    cons_id: &str,
    field_name: &str,
) -> Result<Option<String>> {
    let row = sqlx::query(
        r#"
        select source
        from sys.cons_change_log
        where cons_id = $1 and field_name = $2
        order by created_at desc, id desc
        limit 1
        "#,
    )
    .bind(cons_id)
    .bind(field_name)
    .fetch_optional(conn)
    .await
    .context("last_change_source failed")?;
    row.map(|r| r.try_get::<String, _>("source").map_err(Into::into))
        .transpose()
}

// ---------------------------------------------------------------------------
// Webhook log (log.webhook_log)
// ---------------------------------------------------------------------------

/// Persist a raw inbound payload before processing. Pool-scoped: the row must
/// survive a handler rollback so the failure is auditable.
pub async fn insert_webhook_log(
    pool: &PgPool,
    source: &str,
    payload: &serde_json::Value,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into log.webhook_log (source, payload)
        values ($1, $2)
        returning id
        "#,
    )
    .bind(source)
    .bind(payload)
    .fetch_one(pool)
    .await
    .context("insert_webhook_log failed")?;
    Ok(id)
}

pub async fn mark_webhook_processed(pool: &PgPool, id: i64) -> Result<()> {
    sqlx::query("update log.webhook_log set processed = true where id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("mark_webhook_processed failed")?;
    Ok(())
}

pub async fn mark_webhook_error(pool: &PgPool, id: i64, error: &str) -> Result<()> {
    sqlx::query("update log.webhook_log set error_message = $2 where id = $1")
        .bind(id)
        .bind(error)
        .execute(pool)
        .await
        .context("mark_webhook_error failed")?;
    Ok(())
}
