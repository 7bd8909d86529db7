//! Operator selection and wait-time estimation.
//!
//! `engine` holds the pure filtering/ranking core; this module assembles its
//! inputs from the store and converts wall-clock time into the business
//! timezone.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rand::Rng;
use sqlx::PgConnection;
use tracing::{debug, warn};
use uuid::Uuid;

use cmw_schemas::ConsultationType;

pub mod engine;

pub use engine::{
    wait_estimate, within_working_hours, CandidateOperator, Language, SelectionRequest,
    WaitEstimate, ACCOUNTING_DEPARTMENT, DEFAULT_CONSULTATION_MINUTES,
};

/// Routing inputs carried by the consultation being placed.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    pub category_key: Option<Uuid>,
    pub po_section_key: Option<Uuid>,
    pub language: Option<Language>,
}

/// Pick an operator for a consultation, or `None` when nobody is available.
pub async fn select_operator<R: Rng>(
    conn: &mut PgConnection,
    consultation_type: ConsultationType,
    ctx: &RoutingContext,
    now: DateTime<Utc>,
    business_tz: Tz,
    rng: &mut R,
) -> Result<Option<Uuid>> {
    let local = now.with_timezone(&business_tz);
    let today = local.date_naive();

    let users = cmw_db::load_selectable_users(conn).await?;
    let skill_pairs = cmw_db::load_all_skills(conn).await?;
    let closed: HashSet<Uuid> = cmw_db::closed_manager_keys(conn, today)
        .await?
        .into_iter()
        .collect();

    let mut skills_by_user: HashMap<Uuid, HashSet<Uuid>> = HashMap::new();
    for (user_key, category_key) in skill_pairs {
        skills_by_user.entry(user_key).or_default().insert(category_key);
    }

    let category_language = match ctx.category_key {
        Some(category_key) => cmw_db::category_language(conn, category_key)
            .await?
            .as_deref()
            .and_then(Language::parse),
        None => None,
    };

    let mut operators = Vec::with_capacity(users.len());
    for user in users {
        let Some(ref_key) = user.cl_ref_key else {
            continue;
        };
        let queue_count = cmw_db::queue_count(conn, &ref_key.to_string()).await?;
        operators.push(CandidateOperator {
            ref_key,
            department: user.department,
            con_limit: i64::from(user.con_limit.unwrap_or(0)),
            start_hour: user.start_hour,
            end_hour: user.end_hour,
            ru: user.ru,
            uz: user.uz,
            skills: skills_by_user.remove(&ref_key).unwrap_or_default(),
            queue_count,
        });
    }

    let req = SelectionRequest {
        now_local: local.time(),
        today,
        consultation_type,
        category_key: ctx.category_key,
        po_section_key: ctx.po_section_key,
        language: ctx.language,
        category_language,
        closed_today: closed,
    };

    let picked = engine::select_operator_from(&req, &operators, rng);
    match picked {
        Some(key) => debug!(operator = %key, "operator selected"),
        None => warn!(
            consultation_type = %consultation_type,
            category = ?ctx.category_key,
            "no available operator matched the selection filters"
        ),
    }
    Ok(picked)
}

/// Queue position and wait estimate for one operator, from live queue depth
/// and the 30-day duration statistic.
pub async fn wait_estimate_for(
    conn: &mut PgConnection,
    manager_key: &str,
    now: DateTime<Utc>,
) -> Result<WaitEstimate> {
    let queue_count = cmw_db::queue_count(conn, manager_key).await?;
    let avg = cmw_db::avg_duration_minutes_30d(conn, manager_key, now).await?;
    Ok(engine::wait_estimate(queue_count, avg))
}
