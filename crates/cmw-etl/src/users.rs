//! Operator puller (`UserCatalog` + satellites) and chat-side user sync.
//!
//! The catalogs are small, so every run rebuilds the picture in full: the
//! user catalog is joined with the department, language, and consultant-list
//! feeds, deleted/invalid/service accounts are dropped, skills are truncated
//! and re-inserted, and finally every operator that still lacks a chat
//! identity is looked up (ERP key, agent scan, e-mail — in that order) or
//! created on the chat side.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use sqlx::PgConnection;
use tracing::{info, warn};
use uuid::Uuid;

use cmw_chat::{ChatAgent, CreateUserOutcome, NewChatUser};
use cmw_db::{NewUser, UserRow};
use cmw_odata::entities::{
    CONSULTANT_LIST_REGISTER, DEPARTMENT_CATALOG, USER_CATALOG, USER_CATEGORY_REGISTER,
    USER_DEPARTMENT_REGISTER, USER_LANGUAGE_REGISTER,
};
use cmw_odata::Query;
use cmw_schemas::{
    ErpConsultantEntry, ErpContactInfo, ErpDepartment, ErpUser, ErpUserCategory,
    ErpUserDepartment, ErpUserLanguage,
};
use cmw_selector::ACCOUNTING_DEPARTMENT;

use crate::{EtlContext, EtlRun};

const SCRIPT: &str = "pull_users";

/// Chat team assigned to accounting-department operators.
const ACCOUNTING_TEAM: &str = "accounting_consultation";

pub async fn run(ctx: &EtlContext) -> Result<()> {
    let mut run = EtlRun::start(SCRIPT, USER_CATALOG, ctx.settings.max_error_logs, &[]);

    let refs = build_reference_maps(ctx).await?;
    let users_raw: Vec<ErpUser> = fetch_all(ctx, USER_CATALOG, None).await?;
    let skills_raw: Vec<ErpUserCategory> = fetch_all(ctx, USER_CATEGORY_REGISTER, None).await?;

    let users = transform_users(ctx, &users_raw, &refs);
    let skills = transform_skills(&skills_raw);
    info!(users = users.len(), skills = skills.len(), "prepared operator rows");

    let mut tx = ctx.pool.begin().await.context("begin users tx")?;
    let mut inserted: u64 = 0;
    let mut updated: u64 = 0;
    for user in &users {
        if cmw_db::upsert_user(&mut tx, user).await? {
            inserted += 1;
        } else {
            updated += 1;
        }
    }
    let skills_inserted = cmw_db::rebuild_skills(&mut tx, &skills).await?;
    tx.commit().await.context("users commit failed")?;
    run.batch_progress(1, users.len(), inserted, updated, 0);
    info!(skills_inserted, "skills rebuilt");

    // Chat-side identities after the catalog lands; a chat failure here must
    // not fail the pull that already succeeded.
    if let Err(e) = sync_users_to_chat(ctx).await {
        warn!(error = %e, "chat user sync failed; catalog pull succeeded");
    }

    run.finish(true);
    Ok(())
}

/// Page through one entity without a filter.
async fn fetch_all<T: DeserializeOwned>(
    ctx: &EtlContext,
    entity: &str,
    orderby: Option<&str>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    let mut skip: i64 = 0;
    loop {
        let query = Query {
            filter: None,
            orderby: orderby.map(str::to_string),
            top: ctx.settings.page_size,
            skip,
        };
        let batch: Vec<T> = ctx
            .odata
            .fetch_page(entity, &query)
            .await
            .with_context(|| format!("fetch {entity}"))?;
        let len = batch.len();
        out.extend(batch);
        if (len as i64) < ctx.settings.page_size {
            break;
        }
        skip += ctx.settings.page_size;
    }
    info!(entity, rows = out.len(), "fetched catalog");
    Ok(out)
}

struct ReferenceMaps {
    departments: HashMap<Uuid, String>,
    user_department: HashMap<Uuid, Uuid>,
    user_languages: HashMap<Uuid, HashSet<Uuid>>,
    consultants: HashMap<Uuid, ConsultantEntry>,
}

#[derive(Default, Clone)]
struct ConsultantEntry {
    con_limit: Option<i32>,
    start_hour: Option<chrono::NaiveTime>,
    end_hour: Option<chrono::NaiveTime>,
}

async fn build_reference_maps(ctx: &EtlContext) -> Result<ReferenceMaps> {
    let departments_raw: Vec<ErpDepartment> = fetch_all(ctx, DEPARTMENT_CATALOG, None).await?;
    let departments = departments_raw
        .into_iter()
        .filter(|d| !d.deletion_mark)
        .filter_map(|d| {
            let key = cmw_mappers::clean_uuid(d.ref_key.as_deref())?;
            Some((key, d.description.unwrap_or_default()))
        })
        .collect();

    let user_dept_raw: Vec<ErpUserDepartment> =
        fetch_all(ctx, USER_DEPARTMENT_REGISTER, None).await?;
    let user_department = user_dept_raw
        .into_iter()
        .filter_map(|r| {
            Some((
                cmw_mappers::clean_uuid(r.manager_key.as_deref())?,
                cmw_mappers::clean_uuid(r.department_key.as_deref())?,
            ))
        })
        .collect();

    let user_lang_raw: Vec<ErpUserLanguage> =
        fetch_all(ctx, USER_LANGUAGE_REGISTER, None).await?;
    let mut user_languages: HashMap<Uuid, HashSet<Uuid>> = HashMap::new();
    for row in user_lang_raw {
        if let (Some(user), Some(lang)) = (
            cmw_mappers::clean_uuid(row.manager_key.as_deref()),
            cmw_mappers::clean_uuid(row.language_key.as_deref()),
        ) {
            user_languages.entry(user).or_default().insert(lang);
        }
    }

    // Latest period wins per operator: the feed is ordered manager asc,
    // period desc, so the first row seen for a key is the current one.
    let consultant_raw: Vec<ErpConsultantEntry> = fetch_all(
        ctx,
        CONSULTANT_LIST_REGISTER,
        Some("Manager_Key asc, Period desc"),
    )
    .await?;
    let mut consultants: HashMap<Uuid, ConsultantEntry> = HashMap::new();
    for row in consultant_raw {
        let Some(key) = cmw_mappers::clean_uuid(row.manager_key.as_deref()) else {
            continue;
        };
        consultants.entry(key).or_insert_with(|| ConsultantEntry {
            con_limit: row
                .consultation_limit
                .as_deref()
                .and_then(|s| s.trim().parse::<i32>().ok()),
            start_hour: cmw_mappers::parse_time_of_day(row.work_start.as_deref()),
            end_hour: cmw_mappers::parse_time_of_day(row.work_end.as_deref()),
        });
    }

    Ok(ReferenceMaps {
        departments,
        user_department,
        user_languages,
        consultants,
    })
}

fn extract_contact_info(contacts: &[ErpContactInfo]) -> (Option<String>, Option<String>) {
    let mut email = None;
    let mut phone = None;
    for contact in contacts {
        match contact.kind.as_deref() {
            Some(ErpContactInfo::KIND_EMAIL) => email = contact.email_address.clone(),
            Some(ErpContactInfo::KIND_PHONE) => phone = contact.phone_number.clone(),
            _ => {}
        }
    }
    (email, phone)
}

fn transform_users(ctx: &EtlContext, rows: &[ErpUser], refs: &ReferenceMaps) -> Vec<NewUser> {
    let lang_ru = Uuid::parse_str(&ctx.settings.lang_ru_key).ok();
    let lang_uz = Uuid::parse_str(&ctx.settings.lang_uz_key).ok();

    let mut out = Vec::new();
    for row in rows {
        let Some(cl_ref_key) = cmw_mappers::clean_uuid(row.ref_key.as_deref()) else {
            continue;
        };
        // Deleted, invalid, and service accounts never become operators.
        if row.deletion_mark || row.invalid || row.service {
            continue;
        }

        let languages = refs.user_languages.get(&cl_ref_key);
        let consultant = refs.consultants.get(&cl_ref_key).cloned().unwrap_or_default();
        let department = refs
            .user_department
            .get(&cl_ref_key)
            .and_then(|dept_key| refs.departments.get(dept_key))
            .cloned();

        let chatwoot_team = match department.as_deref() {
            Some(ACCOUNTING_DEPARTMENT) => Some(ACCOUNTING_TEAM.to_string()),
            _ => None,
        };

        let (email, phone_number) = extract_contact_info(&row.contact_info);

        out.push(NewUser {
            user_id: row.code.clone().or_else(|| row.description.clone()),
            cl_ref_key,
            description: row.description.clone(),
            department,
            chatwoot_team,
            con_limit: consultant.con_limit,
            start_hour: consultant.start_hour,
            end_hour: consultant.end_hour,
            ru: languages
                .zip(lang_ru)
                .map(|(set, key)| set.contains(&key))
                .unwrap_or(false),
            uz: languages
                .zip(lang_uz)
                .map(|(set, key)| set.contains(&key))
                .unwrap_or(false),
            email,
            phone_number,
        });
    }
    out
}

fn transform_skills(rows: &[ErpUserCategory]) -> Vec<(Uuid, Uuid)> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for row in rows {
        if let (Some(user), Some(category)) = (
            cmw_mappers::clean_uuid(row.manager_key.as_deref()),
            cmw_mappers::clean_uuid(row.question_category_key.as_deref()),
        ) {
            if seen.insert((user, category)) {
                out.push((user, category));
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Chat-side user sync
// ---------------------------------------------------------------------------

/// Give every eligible operator a chat identity, creating agents only after
/// the existence checks (ERP key via custom-attribute search, full agent
/// scan, e-mail) come up empty. Every successful linkage also lands in
/// `cons.user_mapping` so the webhook reconciler can translate assignees.
pub async fn sync_users_to_chat(ctx: &EtlContext) -> Result<()> {
    let mut conn = ctx.pool.acquire().await?;
    let users = cmw_db::users_needing_chat_sync(&mut conn).await?;
    if users.is_empty() {
        info!("no operators need a chat identity");
        return Ok(());
    }
    info!(count = users.len(), "syncing operators to chat");

    let mut synced = 0usize;
    let mut failed = 0usize;
    for user in &users {
        match sync_one_user(ctx, &mut conn, user).await {
            Ok(true) => synced += 1,
            Ok(false) => failed += 1,
            Err(e) => {
                failed += 1;
                warn!(operator = ?user.description, error = %e, "operator chat sync failed");
            }
        }
    }

    if failed > 0 {
        warn!(synced, failed, "chat user sync finished with errors");
    } else {
        info!(synced, "chat user sync finished");
    }
    Ok(())
}

async fn link(
    conn: &mut PgConnection,
    user: &UserRow,
    chat_id: u64,
) -> Result<()> {
    cmw_db::set_chat_user_id(&mut *conn, user.account_id, chat_id as i64).await?;
    if let Some(cl_ref_key) = user.cl_ref_key {
        cmw_db::upsert_user_mapping(conn, chat_id as i64, cl_ref_key).await?;
    }
    Ok(())
}

async fn sync_one_user(
    ctx: &EtlContext,
    conn: &mut PgConnection,
    user: &UserRow,
) -> Result<bool> {
    // Already linked: only the mapping row can be missing.
    if let (Some(chat_id), Some(cl_ref_key)) = (user.chatwoot_user_id, user.cl_ref_key) {
        cmw_db::upsert_user_mapping(conn, chat_id, cl_ref_key).await?;
        return Ok(true);
    }

    let email = chat_email_for(user);

    // 1. The ERP key is the most reliable identity: custom-attribute search.
    if let Some(cl_ref_key) = user.cl_ref_key {
        let key_text = cl_ref_key.to_string();
        if let Some(agent) = ctx
            .chat
            .find_user_by_custom_attribute("cl_ref_key", &key_text)
            .await?
        {
            if let Some(id) = agent.id {
                link(conn, user, id).await?;
                return Ok(true);
            }
        }

        // 2. Some deployments do not expose custom attributes on search;
        //    scan the full agent list by key and by e-mail.
        let agents = ctx.chat.list_all_agents().await?;
        if let Some(id) = scan_agents(&agents, &key_text, &email) {
            link(conn, user, id).await?;
            return Ok(true);
        }
    }

    // 3. E-mail lookup.
    if let Some(agent) = ctx.chat.find_user_by_email(&email).await? {
        if let Some(id) = agent.id {
            link(conn, user, id).await?;
            return Ok(true);
        }
    }

    // Nothing found: create the agent, carrying the ERP key as a custom
    // attribute so future syncs can find it again.
    let mut custom_attributes = serde_json::Map::new();
    if let Some(cl_ref_key) = user.cl_ref_key {
        custom_attributes.insert("cl_ref_key".to_string(), cl_ref_key.to_string().into());
    }
    let new_user = NewChatUser {
        name: user
            .description
            .clone()
            .unwrap_or_else(|| format!("Operator {}", user.account_id)),
        email: email.clone(),
        custom_attributes: (!custom_attributes.is_empty()).then_some(custom_attributes),
    };

    match ctx.chat.create_user(&new_user).await? {
        CreateUserOutcome::Created(agent) => match agent.id {
            Some(id) => {
                link(conn, user, id).await?;
                Ok(true)
            }
            None => {
                warn!(operator = ?user.description, "chat returned a created agent without an id");
                Ok(false)
            }
        },
        // 422: the e-mail is already registered — look it up once more.
        CreateUserOutcome::AlreadyExists => {
            if let Some(agent) = ctx.chat.find_user_by_email(&email).await? {
                if let Some(id) = agent.id {
                    link(conn, user, id).await?;
                    return Ok(true);
                }
            }
            warn!(operator = ?user.description, email = %email, "agent exists in chat but could not be found");
            Ok(false)
        }
    }
}

fn scan_agents(agents: &[ChatAgent], cl_ref_key: &str, email: &str) -> Option<u64> {
    for agent in agents {
        let by_key = agent
            .custom_attributes
            .as_ref()
            .and_then(|attrs| attrs.get("cl_ref_key"))
            .and_then(|v| v.as_str())
            .map(|v| v == cl_ref_key)
            .unwrap_or(false);
        let by_email = agent
            .email
            .as_deref()
            .map(|e| e.trim().eq_ignore_ascii_case(email))
            .unwrap_or(false);
        if by_key || by_email {
            return agent.id;
        }
    }
    None
}

/// The chat platform requires a unique e-mail. Operators without a real one
/// get a deterministic technical address derived from the ERP key, so every
/// sync converges on the same chat user.
pub fn chat_email_for(user: &UserRow) -> String {
    for candidate in [user.email.as_deref(), user.user_id.as_deref(), user.description.as_deref()] {
        if let Some(c) = candidate {
            if c.contains('@') {
                return c.trim().to_ascii_lowercase();
            }
        }
    }
    if let Some(cl_ref_key) = user.cl_ref_key {
        return format!("{cl_ref_key}@cons.local");
    }
    format!("operator-{}@cons.local", user.account_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_email_prefers_real_addresses() {
        let mut user = UserRow {
            account_id: 5,
            email: Some("Agent@Example.com".to_string()),
            ..Default::default()
        };
        assert_eq!(chat_email_for(&user), "agent@example.com");

        user.email = None;
        user.cl_ref_key = Uuid::parse_str("15d38cda-1812-11ef-b824-c67597d01fa8").ok();
        assert_eq!(
            chat_email_for(&user),
            "15d38cda-1812-11ef-b824-c67597d01fa8@cons.local"
        );

        user.cl_ref_key = None;
        assert_eq!(chat_email_for(&user), "operator-5@cons.local");
    }

    #[test]
    fn chat_email_is_deterministic() {
        let user = UserRow {
            account_id: 9,
            cl_ref_key: Uuid::parse_str("25d38cda-1812-11ef-b824-c67597d01fa8").ok(),
            ..Default::default()
        };
        assert_eq!(chat_email_for(&user), chat_email_for(&user));
    }

    #[test]
    fn scan_matches_by_key_or_email() {
        let agents = vec![
            ChatAgent {
                id: Some(3),
                email: Some("a@x.io".to_string()),
                ..Default::default()
            },
            ChatAgent {
                id: Some(4),
                custom_attributes: Some(
                    serde_json::json!({ "cl_ref_key": "abc" })
                        .as_object()
                        .cloned()
                        .unwrap(),
                ),
                ..Default::default()
            },
        ];
        assert_eq!(scan_agents(&agents, "abc", "nobody@x.io"), Some(4));
        assert_eq!(scan_agents(&agents, "zzz", "A@X.IO"), Some(3));
        assert_eq!(scan_agents(&agents, "zzz", "nobody@x.io"), None);
    }
}
