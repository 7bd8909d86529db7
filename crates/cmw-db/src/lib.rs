//! Postgres store for the consultation sync middleware.
//!
//! Conventions:
//! - functions that must participate in a batch transaction take
//!   `&mut PgConnection` (pass `&mut *tx` from a `sqlx::Transaction`);
//! - functions whose commit must be independent of the batch take `&PgPool`
//!   and run on their own connection (checkpoint saves, the notification
//!   ledger, webhook log rows);
//! - all conflict handling goes through Postgres unique constraints and
//!   `ON CONFLICT` clauses.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub mod checkpoint;
pub mod cons;
pub mod ledger;
pub mod registers;
pub mod users;

pub use checkpoint::*;
pub use cons::*;
pub use ledger::*;
pub use registers::*;
pub use users::*;

pub const ENV_DB_URL: &str = "DATABASE_URL";

/// Connect using `DATABASE_URL`. ETL processes keep the pool small: one
/// writer plus headroom for the independently-committing ledger/checkpoint
/// connections.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

pub async fn connect(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Run embedded migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = 'cons' and table_name = 'cons'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_cons_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_cons_table: bool,
}

// ---------------------------------------------------------------------------
// Per-entity advisory lock
// ---------------------------------------------------------------------------

/// A session-scoped Postgres advisory lock keyed by entity name, held on a
/// dedicated pool connection. Overlapping scheduler invocations of the same
/// puller cannot both acquire it, so the checkpoint has a single writer.
///
/// Call [`EntityLock::release`] when done; returning the connection to the
/// pool without unlocking would leak the lock to the next borrower.
pub struct EntityLock {
    conn: sqlx::pool::PoolConnection<sqlx::Postgres>,
    key: i64,
    pub entity: String,
}

impl EntityLock {
    /// Try to take the lock. `None` means another process holds it.
    pub async fn try_acquire(pool: &PgPool, entity: &str) -> Result<Option<EntityLock>> {
        let mut conn = pool.acquire().await.context("acquire lock connection")?;
        let key = advisory_key(entity);
        let (locked,): (bool,) = sqlx::query_as("select pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .context("pg_try_advisory_lock failed")?;
        if !locked {
            return Ok(None);
        }
        Ok(Some(EntityLock {
            conn,
            key,
            entity: entity.to_string(),
        }))
    }

    pub async fn release(mut self) -> Result<()> {
        sqlx::query("select pg_advisory_unlock($1)")
            .bind(self.key)
            .execute(&mut *self.conn)
            .await
            .context("pg_advisory_unlock failed")?;
        Ok(())
    }
}

/// Stable 64-bit key for an entity name (FNV-1a).
pub fn advisory_key(entity: &str) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in entity.as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash as i64
}

/// Detect a Postgres unique constraint violation by name.
pub fn is_unique_constraint_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.constraint() == Some(constraint)
                || (db_err.code().as_deref() == Some("23505")
                    && db_err.constraint() == Some(constraint))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_keys_are_stable_and_distinct() {
        let a = advisory_key("ConsultationDoc");
        assert_eq!(a, advisory_key("ConsultationDoc"));
        assert_ne!(a, advisory_key("ConsultationDoc_ALL"));
        assert_ne!(a, advisory_key("RatingRegister"));
    }
}
