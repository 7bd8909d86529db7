//! Pure ERP→domain translation.
//!
//! Deterministic conversion only: no IO, no store access. Every function is
//! total over its input — malformed values map to `None` rather than errors,
//! because per-record semantic problems must skip the record, not abort a
//! pull.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde_json::Value;
use uuid::Uuid;

use cmw_schemas::ConsStatus;

/// Request-kind words carried by `ConsultationDoc.RequestKind`.
pub const KIND_ACCOUNTING: &str = "AccountingConsultation";
pub const KIND_QUEUE: &str = "ConsultationQueue";
pub const KIND_OTHER: &str = "Other";

/// The all-zero UUID means "absent" in ERP references.
const NIL_UUID: &str = "00000000-0000-0000-0000-000000000000";

/// ERP encodes "no date" as year one.
const ABSENT_DATE_PREFIX: &str = "0001-01-01";

// ---------------------------------------------------------------------------
// Status mapping
// ---------------------------------------------------------------------------

/// Map an ERP document to a store status.
///
/// Precedence order is load-bearing:
/// 1. `denied` (closed without consultation) forces `cancelled`, even when
///    an end date is filled;
/// 2. a filled end date means `closed`;
/// 3. otherwise the request-kind word decides;
/// 4. anything else is `new`.
pub fn map_status(
    request_kind: Option<&str>,
    end_date: Option<DateTime<Utc>>,
    denied: bool,
) -> ConsStatus {
    if denied {
        return ConsStatus::Cancelled;
    }
    if end_date.is_some() {
        return ConsStatus::Closed;
    }
    match request_kind.map(str::trim) {
        Some(KIND_ACCOUNTING) => ConsStatus::Open,
        Some(KIND_QUEUE) => ConsStatus::Pending,
        Some(KIND_OTHER) => ConsStatus::Other,
        _ => ConsStatus::New,
    }
}

// ---------------------------------------------------------------------------
// Scalar cleaning
// ---------------------------------------------------------------------------

/// Normalize an ERP UUID reference: empty and all-zero values are absent.
pub fn clean_uuid(raw: Option<&str>) -> Option<Uuid> {
    let raw = raw?.trim();
    if raw.is_empty() || raw == NIL_UUID {
        return None;
    }
    Uuid::parse_str(raw).ok()
}

/// Parse an `Edm.DateTime` value. `0001-01-01…` is the ERP "absent" sentinel;
/// naive timestamps are promoted to UTC.
pub fn clean_datetime(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if raw.is_empty() || raw.starts_with(ABSENT_DATE_PREFIX) {
        return None;
    }
    parse_datetime_utc(raw)
}

/// Parse a time-of-day field. The consultant register stores working hours as
/// `0001-01-01THH:MM:SS` — the sentinel *date* with a meaningful time — so
/// only values with that prefix carry a time at all.
pub fn parse_time_of_day(raw: Option<&str>) -> Option<NaiveTime> {
    let raw = raw?.trim();
    let rest = raw.strip_prefix("0001-01-01T")?;
    let rest = rest
        .trim_end_matches('Z')
        .split('+')
        .next()
        .unwrap_or(rest);
    NaiveTime::parse_from_str(rest, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(rest, "%H:%M"))
        .ok()
}

fn parse_datetime_utc(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

// ---------------------------------------------------------------------------
// Lenient parsers for mirrored custom attributes
// ---------------------------------------------------------------------------

/// Parse a webhook custom-attribute datetime leniently (ISO 8601, with or
/// without offset; naive values are UTC).
pub fn lenient_datetime(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?.trim();
    if s.is_empty() {
        return None;
    }
    parse_datetime_utc(s).or_else(|| {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive))
    })
}

/// Parse a webhook custom-attribute date (date part of any accepted datetime).
pub fn lenient_date(value: &Value) -> Option<NaiveDate> {
    lenient_datetime(value).map(|dt| dt.date_naive())
}

/// Parse `HH:MM` or `HH:MM:SS` time-of-day.
pub fn lenient_time(value: &Value) -> Option<NaiveTime> {
    let s = value.as_str()?.trim();
    let mut parts = s.split(':');
    let hour: u32 = parts.next()?.parse().ok()?;
    let minute: u32 = parts.next()?.parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// Parse a boolean that may arrive as bool, "true"/"false"/"yes"/"1"/"0", or
/// a number. Unrecognized values are `false`.
pub fn lenient_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes"
        ),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

/// Whole minutes between start and end, for the "call lasted N minutes"
/// closing message. `None` when either bound is missing or the interval is
/// not positive.
pub fn call_duration_minutes(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Option<i64> {
    let minutes = (end? - start?).num_minutes();
    (minutes > 0).then_some(minutes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> DateTime<Utc> {
        clean_datetime(Some(s)).unwrap()
    }

    #[test]
    fn denied_wins_over_end_date() {
        let end = Some(dt("2025-03-02T10:15:00"));
        assert_eq!(map_status(Some(KIND_ACCOUNTING), end, true), ConsStatus::Cancelled);
    }

    #[test]
    fn end_date_wins_over_kind() {
        let end = Some(dt("2025-03-02T10:15:00"));
        assert_eq!(map_status(Some(KIND_ACCOUNTING), end, false), ConsStatus::Closed);
        assert_eq!(map_status(Some(KIND_QUEUE), end, false), ConsStatus::Closed);
    }

    #[test]
    fn kind_words_map_when_open() {
        assert_eq!(map_status(Some(KIND_ACCOUNTING), None, false), ConsStatus::Open);
        assert_eq!(map_status(Some(KIND_QUEUE), None, false), ConsStatus::Pending);
        assert_eq!(map_status(Some(KIND_OTHER), None, false), ConsStatus::Other);
        assert_eq!(map_status(Some("  ConsultationQueue  "), None, false), ConsStatus::Pending);
        assert_eq!(map_status(Some("Unknown"), None, false), ConsStatus::New);
        assert_eq!(map_status(None, None, false), ConsStatus::New);
    }

    #[test]
    fn zero_uuid_is_absent() {
        assert_eq!(clean_uuid(Some("00000000-0000-0000-0000-000000000000")), None);
        assert_eq!(clean_uuid(Some("")), None);
        assert_eq!(clean_uuid(None), None);
        assert!(clean_uuid(Some("15d38cda-1812-11ef-b824-c67597d01fa8")).is_some());
        assert_eq!(clean_uuid(Some("not-a-uuid")), None);
    }

    #[test]
    fn year_one_datetime_is_absent() {
        assert_eq!(clean_datetime(Some("0001-01-01T00:00:00")), None);
        assert_eq!(clean_datetime(Some("")), None);
        assert_eq!(clean_datetime(None), None);
    }

    #[test]
    fn naive_datetimes_promote_to_utc() {
        let a = clean_datetime(Some("2025-10-20T09:28:15")).unwrap();
        let b = clean_datetime(Some("2025-10-20T09:28:15Z")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn time_of_day_lives_on_the_sentinel_date() {
        let t = parse_time_of_day(Some("0001-01-01T09:30:00")).unwrap();
        assert_eq!(t, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        // A real datetime is not a time-of-day value.
        assert_eq!(parse_time_of_day(Some("2025-01-01T09:30:00")), None);
        assert_eq!(parse_time_of_day(None), None);
    }

    #[test]
    fn lenient_bool_accepts_all_shapes() {
        assert!(lenient_bool(&Value::Bool(true)));
        assert!(lenient_bool(&Value::String("true".into())));
        assert!(lenient_bool(&Value::String("1".into())));
        assert!(lenient_bool(&serde_json::json!(1)));
        assert!(!lenient_bool(&Value::String("false".into())));
        assert!(!lenient_bool(&serde_json::json!(0)));
        assert!(!lenient_bool(&Value::Null));
    }

    #[test]
    fn lenient_time_parses_hh_mm() {
        assert_eq!(
            lenient_time(&Value::String("12:00".into())),
            NaiveTime::from_hms_opt(12, 0, 0)
        );
        assert_eq!(
            lenient_time(&Value::String("09:15:30".into())),
            NaiveTime::from_hms_opt(9, 15, 0)
        );
        assert_eq!(lenient_time(&Value::String("later".into())), None);
    }

    #[test]
    fn duration_minutes_requires_positive_interval() {
        let start = Some(dt("2025-03-02T10:00:00"));
        let end = Some(dt("2025-03-02T10:15:00"));
        assert_eq!(call_duration_minutes(start, end), Some(15));
        assert_eq!(call_duration_minutes(end, start), None);
        assert_eq!(call_duration_minutes(start, start), None);
        assert_eq!(call_duration_minutes(None, end), None);
    }
}
