//! Operator store: `cons.users`, `cons.users_skill`, `cons.user_mapping`,
//! question-category dictionary reads.

use anyhow::{Context, Result};
use chrono::NaiveTime;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct UserRow {
    pub account_id: i64,
    pub user_id: Option<String>,
    pub cl_ref_key: Option<Uuid>,
    pub description: Option<String>,
    pub department: Option<String>,
    pub chatwoot_team: Option<String>,
    pub con_limit: Option<i32>,
    pub start_hour: Option<NaiveTime>,
    pub end_hour: Option<NaiveTime>,
    pub ru: bool,
    pub uz: bool,
    pub deletion_mark: bool,
    pub invalid: bool,
    pub consultation_enabled: bool,
    pub chatwoot_user_id: Option<i64>,
    pub email: Option<String>,
    pub phone_number: Option<String>,
}

/// Fields written by the users puller (everything except `account_id` and
/// `chatwoot_user_id`, which belong to the chat sync).
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub user_id: Option<String>,
    pub cl_ref_key: Uuid,
    pub description: Option<String>,
    pub department: Option<String>,
    pub chatwoot_team: Option<String>,
    pub con_limit: Option<i32>,
    pub start_hour: Option<NaiveTime>,
    pub end_hour: Option<NaiveTime>,
    pub ru: bool,
    pub uz: bool,
    pub email: Option<String>,
    pub phone_number: Option<String>,
}

const USER_COLUMNS: &str = r#"
    account_id, user_id, cl_ref_key, description, department, chatwoot_team,
    con_limit, start_hour, end_hour, ru, uz,
    deletion_mark, invalid, consultation_enabled,
    chatwoot_user_id, email, phone_number
"#;

fn row_to_user(row: &PgRow) -> Result<UserRow> {
    Ok(UserRow {
        account_id: row.try_get("account_id")?,
        user_id: row.try_get("user_id")?,
        cl_ref_key: row.try_get("cl_ref_key")?,
        description: row.try_get("description")?,
        department: row.try_get("department")?,
        chatwoot_team: row.try_get("chatwoot_team")?,
        con_limit: row.try_get("con_limit")?,
        start_hour: row.try_get("start_hour")?,
        end_hour: row.try_get("end_hour")?,
        ru: row.try_get("ru")?,
        uz: row.try_get("uz")?,
        deletion_mark: row.try_get("deletion_mark")?,
        invalid: row.try_get("invalid")?,
        consultation_enabled: row.try_get("consultation_enabled")?,
        chatwoot_user_id: row.try_get("chatwoot_user_id")?,
        email: row.try_get("email")?,
        phone_number: row.try_get("phone_number")?,
    })
}

/// Upsert one catalog row by `cl_ref_key`. Returns true on insert, false on
/// update.
pub async fn upsert_user(conn: &mut PgConnection, user: &NewUser) -> Result<bool> {
    let (inserted,): (bool,) = sqlx::query_as(
        r#"
        insert into cons.users (
            user_id, cl_ref_key, description, department, chatwoot_team,
            con_limit, start_hour, end_hour, ru, uz,
            deletion_mark, invalid, email, phone_number, updated_at
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, false, false, $11, $12, now())
        on conflict (cl_ref_key) do update
            set user_id       = excluded.user_id,
                description   = excluded.description,
                department    = excluded.department,
                chatwoot_team = excluded.chatwoot_team,
                con_limit     = excluded.con_limit,
                start_hour    = excluded.start_hour,
                end_hour      = excluded.end_hour,
                ru            = excluded.ru,
                uz            = excluded.uz,
                deletion_mark = false,
                invalid       = false,
                email         = excluded.email,
                phone_number  = excluded.phone_number,
                updated_at    = now()
        returning (xmax = 0) as inserted
        "#,
    )
    .bind(&user.user_id)
    .bind(user.cl_ref_key)
    .bind(&user.description)
    .bind(&user.department)
    .bind(&user.chatwoot_team)
    .bind(user.con_limit)
    .bind(user.start_hour)
    .bind(user.end_hour)
    .bind(user.ru)
    .bind(user.uz)
    .bind(&user.email)
    .bind(&user.phone_number)
    .fetch_one(conn)
    .await
    .context("upsert_user failed")?;
    Ok(inserted)
}

/// Rebuild the skill set from scratch.
pub async fn rebuild_skills(
    conn: &mut PgConnection,
    skills: &[(Uuid, Uuid)],
) -> Result<usize> {
    sqlx::query("truncate cons.users_skill")
        .execute(&mut *conn)
        .await
        .context("users_skill truncate failed")?;

    for (user_key, category_key) in skills {
        sqlx::query(
            r#"
            insert into cons.users_skill (user_key, category_key)
            values ($1, $2)
            on conflict (user_key, category_key) do nothing
            "#,
        )
        .bind(user_key)
        .bind(category_key)
        .execute(&mut *conn)
        .await
        .context("users_skill insert failed")?;
    }
    Ok(skills.len())
}

/// All skill pairs, for the selector's in-process candidate filter.
pub async fn load_all_skills(conn: &mut PgConnection) -> Result<Vec<(Uuid, Uuid)>> {
    let rows = sqlx::query("select user_key, category_key from cons.users_skill")
        .fetch_all(conn)
        .await
        .context("load_all_skills failed")?;
    rows.into_iter()
        .map(|r| {
            Ok((
                r.try_get::<Uuid, _>("user_key")?,
                r.try_get::<Uuid, _>("category_key")?,
            ))
        })
        .collect()
}

/// Active operators eligible for selection (flags and limits are checked in
/// SQL; hours/skills/closures are filtered in-process).
pub async fn load_selectable_users(conn: &mut PgConnection) -> Result<Vec<UserRow>> {
    let rows = sqlx::query(&format!(
        r#"
        select {USER_COLUMNS}
        from cons.users
        where deletion_mark = false
          and invalid = false
          and consultation_enabled = true
          and con_limit is not null
          and con_limit > 0
          and cl_ref_key is not null
        "#
    ))
    .fetch_all(conn)
    .await
    .context("load_selectable_users failed")?;
    rows.iter().map(row_to_user).collect()
}

pub async fn find_user_by_ref_key(
    conn: &mut PgConnection,
    ref_key: Uuid,
) -> Result<Option<UserRow>> {
    let row = sqlx::query(&format!(
        "select {USER_COLUMNS} from cons.users where cl_ref_key = $1"
    ))
    .bind(ref_key)
    .fetch_optional(conn)
    .await
    .context("find_user_by_ref_key failed")?;
    row.as_ref().map(row_to_user).transpose()
}

/// Operator display name, for notification texts.
pub async fn user_display_name(
    conn: &mut PgConnection,
    ref_key: Uuid,
) -> Result<Option<String>> {
    Ok(find_user_by_ref_key(conn, ref_key)
        .await?
        .filter(|u| !u.deletion_mark)
        .and_then(|u| u.description.or(u.user_id)))
}

pub async fn set_chat_user_id(
    conn: &mut PgConnection,
    account_id: i64,
    chatwoot_user_id: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        update cons.users
           set chatwoot_user_id = $2, updated_at = now()
         where account_id = $1
        "#,
    )
    .bind(account_id)
    .bind(chatwoot_user_id)
    .execute(conn)
    .await
    .context("set_chat_user_id failed")?;
    Ok(())
}

/// Operators that still need a chat-side identity: no chat user id yet, a
/// consultation limit, working hours, and not deleted/invalid — plus linked
/// operators whose mapping row is missing.
pub async fn users_needing_chat_sync(conn: &mut PgConnection) -> Result<Vec<UserRow>> {
    let rows = sqlx::query(&format!(
        r#"
        select {USER_COLUMNS}
        from cons.users u
        where u.deletion_mark = false
          and u.invalid = false
          and u.con_limit is not null
          and (u.start_hour is not null or u.end_hour is not null)
          and (
              u.chatwoot_user_id is null
              or (
                  u.cl_ref_key is not null
                  and not exists (
                      select 1 from cons.user_mapping m
                      where m.chatwoot_user_id = u.chatwoot_user_id
                  )
              )
          )
        "#
    ))
    .fetch_all(conn)
    .await
    .context("users_needing_chat_sync failed")?;
    rows.iter().map(row_to_user).collect()
}

// ---------------------------------------------------------------------------
// Chat user mapping
// ---------------------------------------------------------------------------

pub async fn upsert_user_mapping(
    conn: &mut PgConnection,
    chatwoot_user_id: i64,
    cl_manager_key: Uuid,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into cons.user_mapping (chatwoot_user_id, cl_manager_key)
        values ($1, $2)
        on conflict (chatwoot_user_id) do update
            set cl_manager_key = excluded.cl_manager_key,
                updated_at     = now()
        "#,
    )
    .bind(chatwoot_user_id)
    .bind(cl_manager_key)
    .execute(conn)
    .await
    .context("upsert_user_mapping failed")?;
    Ok(())
}

/// Translate a chat assignee id to an ERP operator key.
pub async fn manager_key_for_chat_user(
    conn: &mut PgConnection,
    chatwoot_user_id: i64,
) -> Result<Option<Uuid>> {
    let row = sqlx::query(
        r#"
        select cl_manager_key
        from cons.user_mapping
        where chatwoot_user_id = $1
        "#,
    )
    .bind(chatwoot_user_id)
    .fetch_optional(conn)
    .await
    .context("manager_key_for_chat_user failed")?;
    row.map(|r| r.try_get::<Uuid, _>("cl_manager_key").map_err(Into::into))
        .transpose()
}

/// Reverse lookup: the chat user id for an ERP operator (mapping first, user
/// row as fallback).
pub async fn chat_user_for_manager_key(
    conn: &mut PgConnection,
    manager_key: Uuid,
) -> Result<Option<i64>> {
    let row = sqlx::query(
        r#"
        select chatwoot_user_id
        from cons.user_mapping
        where cl_manager_key = $1
        limit 1
        "#,
    )
    .bind(manager_key)
    .fetch_optional(&mut *conn)
    .await
    .context("chat_user_for_manager_key failed")?;
    if let Some(row) = row {
        return Ok(Some(row.try_get("chatwoot_user_id")?));
    }
    Ok(find_user_by_ref_key(conn, manager_key)
        .await?
        .filter(|u| !u.deletion_mark && !u.invalid)
        .and_then(|u| u.chatwoot_user_id))
}

/// Language tag of a question category, when the dictionary knows it.
pub async fn category_language(
    conn: &mut PgConnection,
    category_key: Uuid,
) -> Result<Option<String>> {
    let row = sqlx::query(
        r#"
        select language
        from cons.question_categories
        where ref_key = $1
        "#,
    )
    .bind(category_key)
    .fetch_optional(conn)
    .await
    .context("category_language failed")?;
    Ok(row.and_then(|r| r.try_get::<Option<String>, _>("language").ok().flatten()))
}
