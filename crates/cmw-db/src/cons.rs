//! Consultation store (`cons.cons` + `cons.q_and_a`).

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use cmw_schemas::{ConsId, ConsStatus, ConsultationType};

/// One `cons.cons` row. `manager` stays textual: it normally holds an ERP
/// operator UUID, but the webhook reconciler stores a raw chat user id when
/// no mapping exists.
#[derive(Debug, Clone)]
pub struct ConsultationRow {
    pub cons_id: String,
    pub cl_ref_key: Option<Uuid>,
    pub number: Option<String>,
    pub status: ConsStatus,
    pub consultation_type: ConsultationType,
    pub denied: bool,
    pub create_date: DateTime<Utc>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub redate: Option<NaiveDate>,
    pub redate_time: Option<NaiveTime>,
    pub client_key: Option<Uuid>,
    pub client_id: Option<String>,
    pub org_inn: Option<String>,
    pub manager: Option<String>,
    pub author: Option<String>,
    pub comment: Option<String>,
    pub online_question_cat: Option<String>,
    pub online_question: Option<String>,
    pub source: String,
    pub con_blocks: Option<String>,
    pub con_calls: Option<Value>,
    pub con_rates: Option<Value>,
}

impl ConsultationRow {
    pub fn id(&self) -> ConsId {
        ConsId::parse(&self.cons_id)
    }
}

const CONS_COLUMNS: &str = r#"
    cons_id, cl_ref_key, number, status, consultation_type, denied,
    create_date, start_date, end_date, redate, redate_time,
    client_key, client_id, org_inn, manager, author, comment,
    online_question_cat, online_question, source,
    con_blocks, con_calls, con_rates
"#;

fn row_to_consultation(row: &PgRow) -> Result<ConsultationRow> {
    let status_raw: String = row.try_get("status")?;
    let type_raw: String = row.try_get("consultation_type")?;
    Ok(ConsultationRow {
        cons_id: row.try_get("cons_id")?,
        cl_ref_key: row.try_get("cl_ref_key")?,
        number: row.try_get("number")?,
        status: ConsStatus::parse(&status_raw)
            .ok_or_else(|| anyhow::anyhow!("invalid status in store: {status_raw}"))?,
        consultation_type: ConsultationType::parse(&type_raw)
            .unwrap_or(ConsultationType::Accounting),
        denied: row.try_get("denied")?,
        create_date: row.try_get("create_date")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        redate: row.try_get("redate")?,
        redate_time: row.try_get("redate_time")?,
        client_key: row.try_get("client_key")?,
        client_id: row.try_get("client_id")?,
        org_inn: row.try_get("org_inn")?,
        manager: row.try_get("manager")?,
        author: row.try_get("author")?,
        comment: row.try_get("comment")?,
        online_question_cat: row.try_get("online_question_cat")?,
        online_question: row.try_get("online_question")?,
        source: row.try_get("source")?,
        con_blocks: row.try_get("con_blocks")?,
        con_calls: row.try_get("con_calls")?,
        con_rates: row.try_get("con_rates")?,
    })
}

pub async fn find_by_ref_key(
    conn: &mut PgConnection,
    ref_key: Uuid,
) -> Result<Option<ConsultationRow>> {
    let row = sqlx::query(&format!(
        "select {CONS_COLUMNS} from cons.cons where cl_ref_key = $1"
    ))
    .bind(ref_key)
    .fetch_optional(conn)
    .await
    .context("find_by_ref_key failed")?;
    row.as_ref().map(row_to_consultation).transpose()
}

pub async fn find_by_cons_id(
    conn: &mut PgConnection,
    cons_id: &str,
) -> Result<Option<ConsultationRow>> {
    let row = sqlx::query(&format!(
        "select {CONS_COLUMNS} from cons.cons where cons_id = $1"
    ))
    .bind(cons_id)
    .fetch_optional(conn)
    .await
    .context("find_by_cons_id failed")?;
    row.as_ref().map(row_to_consultation).transpose()
}

pub async fn insert_consultation(conn: &mut PgConnection, c: &ConsultationRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into cons.cons (
            cons_id, cl_ref_key, number, status, consultation_type, denied,
            create_date, start_date, end_date, redate, redate_time,
            client_key, client_id, org_inn, manager, author, comment,
            online_question_cat, online_question, source,
            con_blocks, con_calls, con_rates
        ) values (
            $1, $2, $3, $4, $5, $6,
            $7, $8, $9, $10, $11,
            $12, $13, $14, $15, $16, $17,
            $18, $19, $20,
            $21, $22, $23
        )
        "#,
    )
    .bind(&c.cons_id)
    .bind(c.cl_ref_key)
    .bind(&c.number)
    .bind(c.status.as_str())
    .bind(c.consultation_type.as_str())
    .bind(c.denied)
    .bind(c.create_date)
    .bind(c.start_date)
    .bind(c.end_date)
    .bind(c.redate)
    .bind(c.redate_time)
    .bind(c.client_key)
    .bind(&c.client_id)
    .bind(&c.org_inn)
    .bind(&c.manager)
    .bind(&c.author)
    .bind(&c.comment)
    .bind(&c.online_question_cat)
    .bind(&c.online_question)
    .bind(&c.source)
    .bind(&c.con_blocks)
    .bind(&c.con_calls)
    .bind(&c.con_rates)
    .execute(conn)
    .await
    .context("insert_consultation failed")?;
    Ok(())
}

/// Full update of the mutable columns by `cons_id`. Callers only invoke this
/// when the merge step found actual field changes, so an unchanged record
/// produces zero writes.
pub async fn update_consultation(conn: &mut PgConnection, c: &ConsultationRow) -> Result<()> {
    sqlx::query(
        r#"
        update cons.cons
           set number              = $2,
               status              = $3,
               consultation_type   = $4,
               denied              = $5,
               start_date          = $6,
               end_date            = $7,
               redate              = $8,
               redate_time         = $9,
               client_key          = $10,
               client_id           = $11,
               org_inn             = $12,
               manager             = $13,
               author              = $14,
               comment             = $15,
               online_question_cat = $16,
               online_question     = $17,
               source              = $18,
               con_blocks          = $19,
               con_calls           = $20,
               con_rates           = $21,
               updated_at          = now()
         where cons_id = $1
        "#,
    )
    .bind(&c.cons_id)
    .bind(&c.number)
    .bind(c.status.as_str())
    .bind(c.consultation_type.as_str())
    .bind(c.denied)
    .bind(c.start_date)
    .bind(c.end_date)
    .bind(c.redate)
    .bind(c.redate_time)
    .bind(c.client_key)
    .bind(&c.client_id)
    .bind(&c.org_inn)
    .bind(&c.manager)
    .bind(&c.author)
    .bind(&c.comment)
    .bind(&c.online_question_cat)
    .bind(&c.online_question)
    .bind(&c.source)
    .bind(&c.con_blocks)
    .bind(&c.con_calls)
    .bind(&c.con_rates)
    .execute(conn)
    .await
    .context("update_consultation failed")?;
    Ok(())
}

pub async fn set_status(
    conn: &mut PgConnection,
    cons_id: &str,
    status: ConsStatus,
) -> Result<()> {
    sqlx::query(
        r#"
        update cons.cons
           set status = $2, updated_at = now()
         where cons_id = $1
        "#,
    )
    .bind(cons_id)
    .bind(status.as_str())
    .execute(conn)
    .await
    .context("set_status failed")?;
    Ok(())
}

/// Set `redate` / `redate_time` from a reschedule's new date.
pub async fn set_redate(
    conn: &mut PgConnection,
    ref_key: Uuid,
    redate: NaiveDate,
    redate_time: NaiveTime,
) -> Result<()> {
    sqlx::query(
        r#"
        update cons.cons
           set redate = $2, redate_time = $3, updated_at = now()
         where cl_ref_key = $1
        "#,
    )
    .bind(ref_key)
    .bind(redate)
    .bind(redate_time)
    .execute(conn)
    .await
    .context("set_redate failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Q&A
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct QaRow {
    pub line_number: i64,
    pub po_type_key: Option<Uuid>,
    pub po_section_key: Option<Uuid>,
    pub con_blocks_key: Option<Uuid>,
    pub manager_help_key: Option<Uuid>,
    pub is_repeat: bool,
    pub question: Option<String>,
    pub answer: Option<String>,
}

/// Rebuild a consultation's Q&A set from scratch: delete by `cons_ref_key`,
/// re-insert the given rows.
pub async fn rebuild_q_and_a(
    conn: &mut PgConnection,
    cons_ref_key: Uuid,
    cons_id: &str,
    rows: &[QaRow],
) -> Result<usize> {
    sqlx::query("delete from cons.q_and_a where cons_ref_key = $1")
        .bind(cons_ref_key)
        .execute(&mut *conn)
        .await
        .context("q_and_a delete failed")?;

    for qa in rows {
        sqlx::query(
            r#"
            insert into cons.q_and_a (
                cons_ref_key, cons_id, line_number, po_type_key, po_section_key,
                con_blocks_key, manager_help_key, is_repeat, question, answer
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            on conflict (cons_ref_key, line_number) do update
                set question = excluded.question,
                    answer   = excluded.answer
            "#,
        )
        .bind(cons_ref_key)
        .bind(cons_id)
        .bind(qa.line_number)
        .bind(qa.po_type_key)
        .bind(qa.po_section_key)
        .bind(qa.con_blocks_key)
        .bind(qa.manager_help_key)
        .bind(qa.is_repeat)
        .bind(&qa.question)
        .bind(&qa.answer)
        .execute(&mut *conn)
        .await
        .context("q_and_a insert failed")?;
    }
    Ok(rows.len())
}

/// First non-null blocking key among a consultation's Q&A rows.
pub async fn first_block_key(
    conn: &mut PgConnection,
    cons_ref_key: Uuid,
) -> Result<Option<String>> {
    let row = sqlx::query(
        r#"
        select con_blocks_key
        from cons.q_and_a
        where cons_ref_key = $1 and con_blocks_key is not null
        order by line_number asc
        limit 1
        "#,
    )
    .bind(cons_ref_key)
    .fetch_optional(conn)
    .await
    .context("first_block_key failed")?;
    Ok(row
        .map(|r| r.try_get::<Uuid, _>("con_blocks_key"))
        .transpose()?
        .map(|u| u.to_string()))
}

/// Ordered JSON array of `(period, manager)` dial attempts for a consultation.
pub async fn calls_aggregate(
    conn: &mut PgConnection,
    cons_key: Uuid,
) -> Result<Option<Value>> {
    let row = sqlx::query(
        r#"
        select json_agg(
                   json_build_object('period', period, 'manager', manager)
                   order by period
               ) as agg
        from cons.calls
        where cons_key = $1
        "#,
    )
    .bind(cons_key)
    .fetch_one(conn)
    .await
    .context("calls_aggregate failed")?;
    Ok(row.try_get("agg")?)
}

// ---------------------------------------------------------------------------
// Queue math inputs
// ---------------------------------------------------------------------------

/// Non-denied pending/open consultations assigned to an operator, across all
/// sources (bulk-pulled rows included — that is their whole purpose).
pub async fn queue_count(conn: &mut PgConnection, manager_key: &str) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        r#"
        select count(*)::bigint
        from cons.cons
        where manager = $1
          and status in ('pending', 'open')
          and denied = false
        "#,
    )
    .bind(manager_key)
    .fetch_one(conn)
    .await
    .context("queue_count failed")?;
    Ok(count)
}

/// Average closed-call duration in minutes over the last 30 days, or `None`
/// when the operator has no usable statistic.
pub async fn avg_duration_minutes_30d(
    conn: &mut PgConnection,
    manager_key: &str,
    now: DateTime<Utc>,
) -> Result<Option<f64>> {
    let row = sqlx::query(
        r#"
        select avg(extract(epoch from (end_date - start_date)) / 60) as avg_minutes
        from cons.cons
        where manager = $1
          and status in ('resolved', 'closed')
          and start_date is not null
          and end_date is not null
          and denied = false
          and end_date >= $2
        "#,
    )
    .bind(manager_key)
    .bind(now - chrono::Duration::days(30))
    .fetch_one(conn)
    .await
    .context("avg_duration_minutes_30d failed")?;
    let avg: Option<f64> = row.try_get("avg_minutes")?;
    Ok(avg.filter(|v| *v > 0.0))
}

/// All `cl_ref_key`s with a non-terminal stored status, for open-update mode.
pub async fn nonterminal_ref_keys(conn: &mut PgConnection) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(
        r#"
        select distinct cl_ref_key
        from cons.cons
        where cl_ref_key is not null
          and status not in ('closed', 'resolved', 'cancelled')
        order by cl_ref_key
        "#,
    )
    .fetch_all(conn)
    .await
    .context("nonterminal_ref_keys failed")?;
    rows.into_iter()
        .map(|r| r.try_get::<Uuid, _>("cl_ref_key").map_err(Into::into))
        .collect()
}

/// Active (open/pending, non-denied) consultations assigned to an operator.
pub async fn active_consultations_of_manager(
    conn: &mut PgConnection,
    manager_key: &str,
) -> Result<Vec<ConsultationRow>> {
    let rows = sqlx::query(&format!(
        r#"
        select {CONS_COLUMNS}
        from cons.cons
        where manager = $1
          and status in ('open', 'pending')
          and denied = false
        "#
    ))
    .bind(manager_key)
    .fetch_all(conn)
    .await
    .context("active_consultations_of_manager failed")?;
    rows.iter().map(row_to_consultation).collect()
}
