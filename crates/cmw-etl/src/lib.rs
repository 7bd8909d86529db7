//! Incremental ETL pullers from ERP.
//!
//! Every puller shares the same skeleton: load the checkpoint, page through
//! the OData collection in ascending source order, process one page per
//! transaction, commit, then save the checkpoint in its own commit so a
//! crash loses at most one batch. Chat fan-out is always demoted to warnings
//! — a pull never fails on downstream errors.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::PgPool;

use cmw_chat::ChatApi;
use cmw_config::Settings;
use cmw_odata::OdataClient;

pub mod bulk;
pub mod calls;
pub mod consultations;
pub mod merge;
pub mod queue_closing;
pub mod ratings;
pub mod redates;
pub mod run_log;
pub mod users;

pub use merge::{build_mirror, merge_consultation, qa_rows, MergeOutcome, StatusFanout};
pub use run_log::EtlRun;

/// Shared dependencies handed to every puller. Clients are passed in
/// explicitly — nothing here is rebuilt per call.
#[derive(Clone)]
pub struct EtlContext {
    pub pool: PgPool,
    pub odata: OdataClient,
    pub chat: Arc<dyn ChatApi>,
    pub settings: Settings,
}

impl EtlContext {
    /// First-run lower bound: `INITIAL_FROM_DATE` at midnight UTC.
    pub fn initial_from(&self) -> DateTime<Utc> {
        let midnight = self
            .settings
            .initial_from_date
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always a valid time");
        Utc.from_utc_datetime(&midnight)
    }
}

/// Fold one observed source timestamp into the running cursor. The cursor is
/// monotone non-decreasing and clamped to `now` — a scheduled-future source
/// timestamp must never pin it forward.
pub fn fold_cursor(
    cursor: Option<DateTime<Utc>>,
    observed: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let observed = observed.min(now);
    match cursor {
        Some(current) if current >= observed => Some(current),
        _ => Some(observed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cursor_is_monotone_and_clamped() {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2025, 3, 9, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 3, 10, 6, 0, 0).unwrap();
        let future = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        let cursor = fold_cursor(None, earlier, now);
        assert_eq!(cursor, Some(earlier));

        // Forward movement.
        let cursor = fold_cursor(cursor, later, now);
        assert_eq!(cursor, Some(later));

        // No backsliding.
        let cursor = fold_cursor(cursor, earlier, now);
        assert_eq!(cursor, Some(later));

        // Future timestamps clamp to now.
        let cursor = fold_cursor(cursor, future, now);
        assert_eq!(cursor, Some(now));
    }
}
