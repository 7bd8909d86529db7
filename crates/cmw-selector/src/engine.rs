//! Pure selection engine.
//!
//! Deterministic candidate filtering and ranking over in-memory snapshots;
//! the only nondeterminism is the final uniform pick among equally loaded
//! candidates, driven by the caller-supplied RNG. No IO here — the DB facade
//! in `lib.rs` assembles the inputs.

use std::collections::HashSet;

use chrono::{NaiveDate, NaiveTime};
use rand::seq::SliceRandom;
use rand::Rng;
use uuid::Uuid;

use cmw_schemas::ConsultationType;

/// Department required for accounting consultations.
pub const ACCOUNTING_DEPARTMENT: &str = "accounting_consultants";

/// Candidates whose load ratio is within this band of the best are tied and
/// picked uniformly at random.
const TIE_BAND_TENTHS: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Ru,
    Uz,
}

impl Language {
    pub fn parse(s: &str) -> Option<Language> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ru" => Some(Language::Ru),
            "uz" => Some(Language::Uz),
            _ => None,
        }
    }
}

/// One operator as seen by the engine.
#[derive(Debug, Clone)]
pub struct CandidateOperator {
    pub ref_key: Uuid,
    pub department: Option<String>,
    pub con_limit: i64,
    pub start_hour: Option<NaiveTime>,
    pub end_hour: Option<NaiveTime>,
    pub ru: bool,
    pub uz: bool,
    pub skills: HashSet<Uuid>,
    /// Non-denied pending/open consultations currently assigned, across all
    /// sources.
    pub queue_count: i64,
}

/// Everything the engine needs to know about the consultation being routed.
#[derive(Debug, Clone)]
pub struct SelectionRequest {
    /// Wall clock in the business timezone.
    pub now_local: NaiveTime,
    pub today: NaiveDate,
    pub consultation_type: ConsultationType,
    pub category_key: Option<Uuid>,
    pub po_section_key: Option<Uuid>,
    /// Language hint carried by the consultation itself.
    pub language: Option<Language>,
    /// Language tag of the question category, when the dictionary knows it.
    pub category_language: Option<Language>,
    /// Operators whose queue is closed today.
    pub closed_today: HashSet<Uuid>,
}

// ---------------------------------------------------------------------------
// Working hours
// ---------------------------------------------------------------------------

/// Is `now` inside `[start, end]`? A window with `start > end` wraps
/// midnight: 22:00–06:00 admits 03:00.
pub fn within_working_hours(start: NaiveTime, end: NaiveTime, now: NaiveTime) -> bool {
    if start <= end {
        start <= now && now <= end
    } else {
        now >= start || now <= end
    }
}

fn hours_admit(candidate: &CandidateOperator, req: &SelectionRequest) -> bool {
    match (candidate.start_hour, candidate.end_hour) {
        (Some(start), Some(end)) => within_working_hours(start, end, req.now_local),
        // Accounting requires both hours set; that is enforced in the
        // eligibility filter, so this arm only fires for other types, where
        // an operator with no hours is always available.
        (None, None) => req.consultation_type != ConsultationType::Accounting,
        _ => req.consultation_type != ConsultationType::Accounting,
    }
}

// ---------------------------------------------------------------------------
// Filtering
// ---------------------------------------------------------------------------

fn speaks(candidate: &CandidateOperator, language: Language) -> bool {
    match language {
        Language::Ru => candidate.ru,
        Language::Uz => candidate.uz,
    }
}

/// Apply every filter stage and return the admissible candidates, skilled
/// operators first, universal (no-skill) operators appended after them.
///
/// Base eligibility (deletion/invalid/enabled/limit > 0) is assumed already
/// enforced by the caller's snapshot query.
pub fn filter_candidates<'a>(
    req: &SelectionRequest,
    operators: &'a [CandidateOperator],
) -> Vec<&'a CandidateOperator> {
    let accounting = req.consultation_type == ConsultationType::Accounting;

    let mut available: Vec<&CandidateOperator> = Vec::new();
    for op in operators {
        if op.con_limit <= 0 {
            continue;
        }
        if accounting {
            if op.department.as_deref() != Some(ACCOUNTING_DEPARTMENT) {
                continue;
            }
            if op.start_hour.is_none() || op.end_hour.is_none() {
                continue;
            }
        }
        if !hours_admit(op, req) {
            continue;
        }
        if req.closed_today.contains(&op.ref_key) {
            continue;
        }
        available.push(op);
    }

    // Skill filter only applies when the consultation names a category or a
    // PO section.
    if req.category_key.is_none() && req.po_section_key.is_none() {
        return available;
    }

    let mut skilled: Vec<&CandidateOperator> = Vec::new();
    let mut universal: Vec<&CandidateOperator> = Vec::new();

    for op in available {
        if op.skills.is_empty() {
            // Universal operators are a low-priority fallback — and never
            // acceptable for accounting, which requires exact skills.
            if !accounting {
                universal.push(op);
            }
            continue;
        }

        if accounting && req.category_key.is_some() {
            // Strict matching: exact category skill plus every known
            // language requirement.
            let category_key = req.category_key.expect("checked above");
            if !op.skills.contains(&category_key) {
                continue;
            }
            if let Some(lang) = req.language {
                if !speaks(op, lang) {
                    continue;
                }
            }
            if let Some(lang) = req.category_language {
                if !speaks(op, lang) {
                    continue;
                }
            }
            skilled.push(op);
        } else {
            match req.category_key {
                Some(category_key) if op.skills.contains(&category_key) => skilled.push(op),
                Some(_) => {}
                // No category, but a PO section: any skilled operator is
                // acceptable.
                None => skilled.push(op),
            }
        }
    }

    skilled.extend(universal);
    skilled
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

/// Is `candidate`'s load ratio within 0.1 of `best`? Computed in integer
/// arithmetic so a difference of exactly 0.1 is reproducibly outside the
/// band: `q_c/l_c - q_b/l_b < 1/10`.
fn within_tie_band(candidate: &CandidateOperator, best: &CandidateOperator) -> bool {
    let lhs = 10 * (candidate.queue_count * best.con_limit - best.queue_count * candidate.con_limit);
    let rhs = TIE_BAND_TENTHS * candidate.con_limit * best.con_limit;
    lhs < rhs
}

/// Rank by load ratio `queue_count / con_limit` and pick uniformly among
/// candidates within 0.1 of the best ratio.
pub fn rank_and_pick<R: Rng>(
    candidates: &[&CandidateOperator],
    rng: &mut R,
) -> Option<Uuid> {
    let best = candidates.iter().copied().min_by(|a, b| {
        // a.q/a.l < b.q/b.l  ⇔  a.q * b.l < b.q * a.l  (limits are positive)
        (a.queue_count * b.con_limit).cmp(&(b.queue_count * a.con_limit))
    })?;

    let tied: Vec<&CandidateOperator> = candidates
        .iter()
        .copied()
        .filter(|c| within_tie_band(c, best))
        .collect();

    tied.choose(rng).map(|c| c.ref_key)
}

/// Filter + rank in one call.
pub fn select_operator_from<R: Rng>(
    req: &SelectionRequest,
    operators: &[CandidateOperator],
    rng: &mut R,
) -> Option<Uuid> {
    let candidates = filter_candidates(req, operators);
    rank_and_pick(&candidates, rng)
}

// ---------------------------------------------------------------------------
// Wait-time math
// ---------------------------------------------------------------------------

/// Display-only wait estimate for a queue-position message. These numbers
/// never enter the notification hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitEstimate {
    /// `queue_count + 1` — where the new consultation would land.
    pub queue_position: i64,
    pub wait_minutes_min: i64,
    pub wait_minutes_max: i64,
    /// True when the message should show a range instead of a single number.
    pub show_range: bool,
}

/// Floor for the per-consultation duration assumption, in minutes.
pub const DEFAULT_CONSULTATION_MINUTES: i64 = 15;

/// Combine an operator's queue depth with their 30-day average duration.
///
/// Statistic ≥ 15 min: single point estimate `queue × stat`. Below 15 min or
/// absent: a `[queue × stat, queue × 15]` range (absent collapses to the
/// 15-minute assumption).
pub fn wait_estimate(queue_count: i64, avg_duration_minutes: Option<f64>) -> WaitEstimate {
    let queue = queue_count.max(0);
    match avg_duration_minutes.map(|m| m.round() as i64).filter(|m| *m > 0) {
        Some(stat) if stat >= DEFAULT_CONSULTATION_MINUTES => WaitEstimate {
            queue_position: queue + 1,
            wait_minutes_min: queue * stat,
            wait_minutes_max: queue * stat,
            show_range: false,
        },
        Some(stat) => WaitEstimate {
            queue_position: queue + 1,
            wait_minutes_min: queue * stat,
            wait_minutes_max: queue * DEFAULT_CONSULTATION_MINUTES,
            show_range: true,
        },
        None => WaitEstimate {
            queue_position: queue + 1,
            wait_minutes_min: queue * DEFAULT_CONSULTATION_MINUTES,
            wait_minutes_max: queue * DEFAULT_CONSULTATION_MINUTES,
            show_range: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn op(key: u128, queue: i64, limit: i64) -> CandidateOperator {
        CandidateOperator {
            ref_key: Uuid::from_u128(key),
            department: Some(ACCOUNTING_DEPARTMENT.to_string()),
            con_limit: limit,
            start_hour: NaiveTime::from_hms_opt(9, 0, 0),
            end_hour: NaiveTime::from_hms_opt(18, 0, 0),
            ru: true,
            uz: false,
            skills: HashSet::new(),
            queue_count: queue,
        }
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn hours_wrap_midnight() {
        assert!(within_working_hours(t(22, 0), t(6, 0), t(3, 0)));
        assert!(within_working_hours(t(22, 0), t(6, 0), t(23, 0)));
        assert!(!within_working_hours(t(22, 0), t(6, 0), t(12, 0)));
        assert!(within_working_hours(t(9, 0), t(18, 0), t(12, 0)));
        assert!(!within_working_hours(t(9, 0), t(18, 0), t(8, 59)));
    }

    #[test]
    fn equal_loads_are_a_tie_and_heavier_is_excluded() {
        let a = op(1, 3, 10);
        let b = op(2, 3, 10);
        let c = op(3, 7, 10);
        let candidates = [&a, &b, &c];
        let mut rng = StdRng::seed_from_u64(7);

        let mut seen_a = false;
        let mut seen_b = false;
        for _ in 0..200 {
            let picked = rank_and_pick(&candidates, &mut rng).unwrap();
            assert_ne!(picked, c.ref_key, "heavily loaded operator must not win");
            seen_a |= picked == a.ref_key;
            seen_b |= picked == b.ref_key;
        }
        assert!(seen_a && seen_b, "tie must be shared between A and B");
    }

    #[test]
    fn exactly_point_one_apart_is_not_a_tie() {
        // 4/10 vs 3/10: the difference is exactly 0.1 — B always wins.
        let a = op(1, 4, 10);
        let b = op(2, 3, 10);
        let candidates = [&a, &b];
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            assert_eq!(rank_and_pick(&candidates, &mut rng), Some(b.ref_key));
        }
    }

    fn base_request() -> SelectionRequest {
        SelectionRequest {
            now_local: t(12, 0),
            today: chrono::NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            consultation_type: ConsultationType::Accounting,
            category_key: None,
            po_section_key: None,
            language: None,
            category_language: None,
            closed_today: HashSet::new(),
        }
    }

    #[test]
    fn accounting_requires_department_and_hours() {
        let mut wrong_dept = op(1, 0, 5);
        wrong_dept.department = Some("support".to_string());
        let mut no_hours = op(2, 0, 5);
        no_hours.start_hour = None;
        no_hours.end_hour = None;
        let good = op(3, 0, 5);

        let ops = vec![wrong_dept, no_hours, good.clone()];
        let picked = filter_candidates(&base_request(), &ops);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].ref_key, good.ref_key);
    }

    #[test]
    fn no_hours_is_always_available_for_tech_support() {
        let mut anytime = op(1, 0, 5);
        anytime.department = None;
        anytime.start_hour = None;
        anytime.end_hour = None;

        let mut req = base_request();
        req.consultation_type = ConsultationType::TechSupport;
        req.now_local = t(3, 30);

        let ops = vec![anytime];
        assert_eq!(filter_candidates(&req, &ops).len(), 1);
    }

    #[test]
    fn queue_closure_excludes_operator() {
        let a = op(1, 0, 5);
        let b = op(2, 0, 5);
        let mut req = base_request();
        req.closed_today.insert(a.ref_key);

        let ops = vec![a, b.clone()];
        let picked = filter_candidates(&req, &ops);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].ref_key, b.ref_key);
    }

    #[test]
    fn accounting_skills_are_strict() {
        let category = Uuid::from_u128(99);

        let mut skilled = op(1, 0, 5);
        skilled.skills.insert(category);
        let mut wrong_skill = op(2, 0, 5);
        wrong_skill.skills.insert(Uuid::from_u128(100));
        let unskilled = op(3, 0, 5); // universal — excluded for accounting

        let mut req = base_request();
        req.category_key = Some(category);

        let ops = vec![skilled.clone(), wrong_skill, unskilled];
        let picked = filter_candidates(&req, &ops);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].ref_key, skilled.ref_key);
    }

    #[test]
    fn accounting_language_must_match_category_language() {
        let category = Uuid::from_u128(99);

        let mut ru_only = op(1, 0, 5);
        ru_only.skills.insert(category);
        let mut uz_speaker = op(2, 0, 5);
        uz_speaker.skills.insert(category);
        uz_speaker.uz = true;

        let mut req = base_request();
        req.category_key = Some(category);
        req.category_language = Some(Language::Uz);

        let ops = vec![ru_only, uz_speaker.clone()];
        let picked = filter_candidates(&req, &ops);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].ref_key, uz_speaker.ref_key);
    }

    #[test]
    fn universal_operators_come_after_skilled_for_other_types() {
        let category = Uuid::from_u128(99);

        let mut skilled = op(1, 0, 5);
        skilled.department = None;
        skilled.skills.insert(category);
        let mut universal = op(2, 0, 5);
        universal.department = None;

        let mut req = base_request();
        req.consultation_type = ConsultationType::TechSupport;
        req.category_key = Some(category);

        let ops = vec![universal.clone(), skilled.clone()];
        let picked = filter_candidates(&req, &ops);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].ref_key, skilled.ref_key);
        assert_eq!(picked[1].ref_key, universal.ref_key);
    }

    #[test]
    fn wait_estimate_point_vs_range() {
        let point = wait_estimate(3, Some(20.0));
        assert_eq!(point.queue_position, 4);
        assert_eq!(point.wait_minutes_min, 60);
        assert_eq!(point.wait_minutes_max, 60);
        assert!(!point.show_range);

        let range = wait_estimate(3, Some(5.0));
        assert_eq!(range.wait_minutes_min, 15);
        assert_eq!(range.wait_minutes_max, 45);
        assert!(range.show_range);

        let none = wait_estimate(2, None);
        assert_eq!(none.wait_minutes_min, 30);
        assert_eq!(none.wait_minutes_max, 30);
        assert!(!none.show_range);
    }
}
