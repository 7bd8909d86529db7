//! Satellite register stores: calls, reschedules, ratings, queue closings.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewCall {
    pub period: DateTime<Utc>,
    pub cons_key: Uuid,
    pub cons_id: Option<String>,
    pub client_key: Option<Uuid>,
    pub client_id: Option<String>,
    pub manager: Option<Uuid>,
}

/// Insert-only; replays of the same `(period, cons_key, manager)` are no-ops.
/// Returns true when a row was actually inserted.
pub async fn insert_call(conn: &mut PgConnection, call: &NewCall) -> Result<bool> {
    let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
        r#"
        insert into cons.calls (period, cons_key, cons_id, client_key, client_id, manager)
        values ($1, $2, $3, $4, $5, $6)
        on conflict (period, cons_key, manager) do nothing
        returning period
        "#,
    )
    .bind(call.period)
    .bind(call.cons_key)
    .bind(&call.cons_id)
    .bind(call.client_key)
    .bind(&call.client_id)
    .bind(call.manager)
    .fetch_optional(conn)
    .await
    .context("insert_call failed")?;
    Ok(row.is_some())
}

// ---------------------------------------------------------------------------
// Reschedules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewRedate {
    pub cons_key: Uuid,
    pub clients_key: Option<Uuid>,
    pub manager_key: Option<Uuid>,
    pub period: DateTime<Utc>,
    pub old_date: Option<DateTime<Utc>>,
    pub new_date: Option<DateTime<Utc>>,
}

/// Insert-only; returns true when the identity tuple was new. A new row is
/// what fires the reschedule notification.
pub async fn insert_redate(conn: &mut PgConnection, redate: &NewRedate) -> Result<bool> {
    let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
        r#"
        insert into cons.cons_redate (cons_key, clients_key, manager_key, period, old_date, new_date)
        values ($1, $2, $3, $4, $5, $6)
        on conflict (cons_key, clients_key, manager_key, period) do nothing
        returning period
        "#,
    )
    .bind(redate.cons_key)
    .bind(redate.clients_key)
    .bind(redate.manager_key)
    .bind(redate.period)
    .bind(redate.old_date)
    .bind(redate.new_date)
    .fetch_optional(conn)
    .await
    .context("insert_redate failed")?;
    Ok(row.is_some())
}

// ---------------------------------------------------------------------------
// Ratings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RatingAnswerRow {
    pub cons_key: Uuid,
    pub cons_id: Option<String>,
    pub client_key: Option<Uuid>,
    pub client_id: Option<String>,
    pub manager_key: Option<Uuid>,
    pub question_number: i64,
    pub rating: Option<i64>,
    pub question_text: Option<String>,
    pub comment: Option<String>,
    pub sent_to_base: bool,
    pub rating_date: Option<DateTime<Utc>>,
}

/// Upsert by `(cons_key, manager_key, question_number)`. Returns true when
/// the row was newly inserted — only new rows fire a rating notification.
pub async fn upsert_rating_answer(
    conn: &mut PgConnection,
    answer: &RatingAnswerRow,
) -> Result<bool> {
    let (inserted,): (bool,) = sqlx::query_as(
        r#"
        insert into cons.cons_rating_answers (
            cons_key, cons_id, client_key, client_id, manager_key,
            question_number, rating, question_text, comment, sent_to_base, rating_date
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        on conflict on constraint uq_cons_rating_answer do update
            set rating        = excluded.rating,
                question_text = excluded.question_text,
                comment       = excluded.comment,
                sent_to_base  = excluded.sent_to_base,
                rating_date   = excluded.rating_date,
                cons_id       = excluded.cons_id,
                client_id     = excluded.client_id,
                updated_at    = now()
        returning (xmax = 0) as inserted
        "#,
    )
    .bind(answer.cons_key)
    .bind(&answer.cons_id)
    .bind(answer.client_key)
    .bind(&answer.client_id)
    .bind(answer.manager_key)
    .bind(answer.question_number)
    .bind(answer.rating)
    .bind(&answer.question_text)
    .bind(&answer.comment)
    .bind(answer.sent_to_base)
    .bind(answer.rating_date)
    .fetch_one(conn)
    .await
    .context("upsert_rating_answer failed")?;
    Ok(inserted)
}

/// Materialize the `{average, count, answers}` aggregate onto the parent
/// consultation. `average = round(sum/count, 2)` over non-null ratings.
pub async fn recalc_con_rates(conn: &mut PgConnection, cons_key: Uuid) -> Result<()> {
    let rows = sqlx::query(
        r#"
        select question_number, rating, question_text, comment, manager_key
        from cons.cons_rating_answers
        where cons_key = $1
        order by question_number asc
        "#,
    )
    .bind(cons_key)
    .fetch_all(&mut *conn)
    .await
    .context("recalc_con_rates select failed")?;

    if rows.is_empty() {
        return Ok(());
    }

    let mut answers = Vec::with_capacity(rows.len());
    let mut ratings: Vec<i64> = Vec::new();
    for row in &rows {
        let rating: Option<i64> = row.try_get("rating")?;
        if let Some(r) = rating {
            ratings.push(r);
        }
        answers.push(json!({
            "question_number": row.try_get::<i64, _>("question_number")?,
            "rating": rating,
            "question": row.try_get::<Option<String>, _>("question_text")?,
            "comment": row.try_get::<Option<String>, _>("comment")?,
            "manager_key": row.try_get::<Option<Uuid>, _>("manager_key")?,
        }));
    }

    let payload = json!({
        "average": rating_average(&ratings),
        "count": ratings.len(),
        "answers": answers,
    });

    sqlx::query(
        r#"
        update cons.cons
           set con_rates = $2, updated_at = now()
         where cl_ref_key = $1
        "#,
    )
    .bind(cons_key)
    .bind(payload)
    .execute(conn)
    .await
    .context("recalc_con_rates update failed")?;
    Ok(())
}

/// `round(sum / count, 2)` over the non-null ratings; `None` when there are
/// none.
pub fn rating_average(ratings: &[i64]) -> Option<f64> {
    if ratings.is_empty() {
        return None;
    }
    let sum: i64 = ratings.iter().sum();
    Some((sum as f64 / ratings.len() as f64 * 100.0).round() / 100.0)
}

// ---------------------------------------------------------------------------
// Queue closings
// ---------------------------------------------------------------------------

/// Materialize a closure for one operator on one day. Returns true when the
/// row is new (which triggers client notifications).
pub async fn upsert_queue_closing(
    conn: &mut PgConnection,
    day: NaiveDate,
    manager_key: Uuid,
) -> Result<bool> {
    let row: Option<(NaiveDate,)> = sqlx::query_as(
        r#"
        insert into cons.queue_closing (period_day, manager_key)
        values ($1, $2)
        on conflict (period_day, manager_key) do nothing
        returning period_day
        "#,
    )
    .bind(day)
    .bind(manager_key)
    .fetch_optional(conn)
    .await
    .context("upsert_queue_closing failed")?;
    Ok(row.is_some())
}

/// `Closed=false` reopens the queue: the materialized row is removed.
pub async fn delete_queue_closing(
    conn: &mut PgConnection,
    day: NaiveDate,
    manager_key: Uuid,
) -> Result<()> {
    sqlx::query(
        r#"
        delete from cons.queue_closing
        where period_day = $1 and manager_key = $2
        "#,
    )
    .bind(day)
    .bind(manager_key)
    .execute(conn)
    .await
    .context("delete_queue_closing failed")?;
    Ok(())
}

/// Operators whose queue is closed on the given day.
pub async fn closed_manager_keys(
    conn: &mut PgConnection,
    day: NaiveDate,
) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(
        r#"
        select manager_key
        from cons.queue_closing
        where period_day = $1
        "#,
    )
    .bind(day)
    .fetch_all(conn)
    .await
    .context("closed_manager_keys failed")?;
    rows.into_iter()
        .map(|r| r.try_get::<Uuid, _>("manager_key").map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rating_average_rounds_to_two_decimals() {
        assert_eq!(rating_average(&[]), None);
        assert_eq!(rating_average(&[4]), Some(4.0));
        assert_eq!(rating_average(&[5, 4]), Some(4.5));
        // 1/3 rounds to 2 decimals, not truncates.
        assert_eq!(rating_average(&[5, 5, 4]), Some(4.67));
        assert_eq!(rating_average(&[1, 2, 2]), Some(1.67));
    }
}
