//! Per-entity sync cursor (`sys.sync_state`).
//!
//! Saved after every processed batch so a crash loses at most one batch of
//! work. The timestamp cursor is clamped to the wall clock at save time:
//! scheduled-future timestamps on source rows must never pin the cursor
//! forward.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use cmw_schemas::Checkpoint;

pub async fn load_checkpoint(pool: &PgPool, entity: &str) -> Result<Checkpoint> {
    let row = sqlx::query(
        r#"
        select last_synced_at, last_synced_key
        from sys.sync_state
        where entity_name = $1
        "#,
    )
    .bind(entity)
    .fetch_optional(pool)
    .await
    .context("load_checkpoint failed")?;

    let Some(row) = row else {
        return Ok(Checkpoint::default());
    };

    Ok(Checkpoint {
        last_synced_at: row.try_get("last_synced_at")?,
        last_synced_key: row.try_get("last_synced_key")?,
    })
}

/// Upsert the cursor. `None` fields keep their stored values (the ratings
/// puller advances the key without always having a timestamp). The timestamp
/// is clamped to `now()` before it is written.
pub async fn save_checkpoint(
    pool: &PgPool,
    entity: &str,
    last_synced_at: Option<DateTime<Utc>>,
    last_synced_key: Option<&str>,
) -> Result<()> {
    let clamped = last_synced_at.map(|ts| ts.min(Utc::now()));

    sqlx::query(
        r#"
        insert into sys.sync_state (entity_name, last_synced_at, last_synced_key, updated_at)
        values ($1, $2, $3, now())
        on conflict (entity_name) do update
            set last_synced_at  = coalesce(excluded.last_synced_at, sys.sync_state.last_synced_at),
                last_synced_key = coalesce(excluded.last_synced_key, sys.sync_state.last_synced_key),
                updated_at      = now()
        "#,
    )
    .bind(entity)
    .bind(clamped)
    .bind(last_synced_key)
    .execute(pool)
    .await
    .context("save_checkpoint failed")?;

    Ok(())
}

/// The effective lower bound for an incremental filter: the stored cursor
/// (itself clamped to now in case old data predates clamping) minus the
/// entity's buffer window. `None` on first run.
pub fn effective_from(
    checkpoint: &Checkpoint,
    now: DateTime<Utc>,
    buffer: chrono::Duration,
) -> Option<DateTime<Utc>> {
    let last = checkpoint.last_synced_at?;
    Some(last.min(now) - buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn effective_from_applies_buffer_and_clamp() {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let cp = Checkpoint {
            last_synced_at: Some(Utc.with_ymd_and_hms(2025, 3, 9, 12, 0, 0).unwrap()),
            last_synced_key: None,
        };
        let from = effective_from(&cp, now, chrono::Duration::days(7)).unwrap();
        assert_eq!(from, Utc.with_ymd_and_hms(2025, 3, 2, 12, 0, 0).unwrap());

        // A future cursor is treated as "now" before the buffer subtraction.
        let future = Checkpoint {
            last_synced_at: Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
            last_synced_key: None,
        };
        let from = effective_from(&future, now, chrono::Duration::days(1)).unwrap();
        assert_eq!(from, now - chrono::Duration::days(1));

        assert_eq!(
            effective_from(&Checkpoint::default(), now, chrono::Duration::days(7)),
            None
        );
    }
}
