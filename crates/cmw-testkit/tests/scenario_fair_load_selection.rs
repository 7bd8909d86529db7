//! Scenario: fair load distribution among accounting operators.
//!
//! Three operators A, B, C with `con_limit = 10`, all in hours, all matching
//! category and language. Loads A=3, B=3, C=7: the pick is near-uniform over
//! {A, B} and never C. When A's load rises to 4, B wins every time until the
//! tie is re-established.

use std::collections::{HashMap, HashSet};

use chrono::{NaiveDate, NaiveTime};
use rand::rngs::StdRng;
use rand::SeedableRng;
use uuid::Uuid;

use cmw_schemas::ConsultationType;
use cmw_selector::engine::{select_operator_from, CandidateOperator, SelectionRequest};
use cmw_selector::{Language, ACCOUNTING_DEPARTMENT};

fn category() -> Uuid {
    Uuid::from_u128(0xC0FFEE)
}

fn operator(key: u128, queue_count: i64) -> CandidateOperator {
    let mut skills = HashSet::new();
    skills.insert(category());
    CandidateOperator {
        ref_key: Uuid::from_u128(key),
        department: Some(ACCOUNTING_DEPARTMENT.to_string()),
        con_limit: 10,
        start_hour: NaiveTime::from_hms_opt(9, 0, 0),
        end_hour: NaiveTime::from_hms_opt(18, 0, 0),
        ru: true,
        uz: false,
        skills,
        queue_count,
    }
}

fn request() -> SelectionRequest {
    SelectionRequest {
        now_local: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
        today: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
        consultation_type: ConsultationType::Accounting,
        category_key: Some(category()),
        po_section_key: None,
        language: Some(Language::Ru),
        category_language: Some(Language::Ru),
        closed_today: HashSet::new(),
    }
}

#[test]
fn tie_is_shared_near_uniformly_and_heavy_operator_never_wins() {
    let a = operator(1, 3);
    let b = operator(2, 3);
    let c = operator(3, 7);
    let ops = vec![a.clone(), b.clone(), c.clone()];
    let req = request();

    let mut rng = StdRng::seed_from_u64(2025);
    let mut wins: HashMap<Uuid, u32> = HashMap::new();
    const TRIALS: u32 = 2000;

    for _ in 0..TRIALS {
        let picked = select_operator_from(&req, &ops, &mut rng).expect("a candidate must win");
        *wins.entry(picked).or_default() += 1;
    }

    assert_eq!(wins.get(&c.ref_key), None, "C (load 0.7) must never be selected");

    let a_wins = *wins.get(&a.ref_key).unwrap_or(&0);
    let b_wins = *wins.get(&b.ref_key).unwrap_or(&0);
    assert_eq!(a_wins + b_wins, TRIALS);

    // Near-uniform: both within 40–60% over 2000 trials.
    let share = f64::from(a_wins) / f64::from(TRIALS);
    assert!(
        (0.4..=0.6).contains(&share),
        "tie split should be near-uniform, got A share {share:.3}"
    );
}

#[test]
fn breaking_the_tie_makes_the_lighter_operator_deterministic() {
    // A=4, B=3: the ratio gap is exactly 0.1, which is outside the tie band.
    let a = operator(1, 4);
    let b = operator(2, 3);
    let ops = vec![a, b.clone()];
    let req = request();

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..200 {
        assert_eq!(
            select_operator_from(&req, &ops, &mut rng),
            Some(b.ref_key),
            "B must win every trial while the tie is broken"
        );
    }
}

#[test]
fn closed_queue_removes_an_otherwise_best_operator() {
    let a = operator(1, 0);
    let b = operator(2, 5);
    let mut req = request();
    req.closed_today.insert(a.ref_key);

    let ops = vec![a, b.clone()];
    let mut rng = StdRng::seed_from_u64(11);
    assert_eq!(select_operator_from(&req, &ops, &mut rng), Some(b.ref_key));
}

#[test]
fn out_of_hours_operator_is_skipped_and_wrap_windows_admit_nightly_work() {
    // A works 22:00–06:00 (wraps midnight); at 03:00 A is in hours.
    let mut night = operator(1, 0);
    night.start_hour = NaiveTime::from_hms_opt(22, 0, 0);
    night.end_hour = NaiveTime::from_hms_opt(6, 0, 0);
    let mut day = operator(2, 0);
    day.start_hour = NaiveTime::from_hms_opt(9, 0, 0);
    day.end_hour = NaiveTime::from_hms_opt(18, 0, 0);

    let mut req = request();
    req.now_local = NaiveTime::from_hms_opt(3, 0, 0).unwrap();

    let ops = vec![night.clone(), day];
    let mut rng = StdRng::seed_from_u64(3);
    assert_eq!(
        select_operator_from(&req, &ops, &mut rng),
        Some(night.ref_key),
        "only the wrap-window operator is available at 03:00"
    );
}
