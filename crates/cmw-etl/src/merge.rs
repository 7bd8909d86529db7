//! Pure merge of an ERP consultation record into the store row.
//!
//! The merge computes the desired row plus the side effects the puller must
//! fan out (chat status flips, reassignment notices); it touches no IO, so
//! the guard rules are testable in isolation. A record merged twice with no
//! source change reports `changed = false` and produces zero writes.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use cmw_db::{ConsultationRow, QaRow};
use cmw_mappers as mappers;
use cmw_schemas::{
    attr_datetime, ChangeSource, ConsId, ConsStatus, ConsultationType, ErpConsultation,
    MirroredAttributes,
};

/// Offset applied to the second (plain Q&A) line array so its line numbers
/// cannot collide with the consultation lines.
pub const QA_SECOND_ARRAY_BASE: i64 = 1000;

#[derive(Debug)]
pub enum MergeError {
    MissingRefKey,
}

impl std::fmt::Display for MergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeError::MissingRefKey => write!(f, "record has no usable Ref_Key"),
        }
    }
}

impl std::error::Error for MergeError {}

/// Chat fan-out decided by a status transition. Only applied when the
/// consultation carries a valid chat id.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusFanout {
    /// `* → closed`: toggle resolved + closing message with call duration.
    Close {
        duration_minutes: Option<i64>,
        end_date: Option<DateTime<Utc>>,
    },
    /// `* → open`
    SetOpen,
    /// `* → pending`
    SetPending,
}

#[derive(Debug, Clone)]
pub struct ManagerChange {
    pub old: Option<String>,
    pub new: String,
}

#[derive(Debug)]
pub struct MergeOutcome {
    pub row: ConsultationRow,
    pub ref_key: Uuid,
    pub created: bool,
    /// Any stored field actually changes value.
    pub changed: bool,
    pub status_change: Option<(ConsStatus, ConsStatus)>,
    pub fanout: Option<StatusFanout>,
    pub manager_change: Option<ManagerChange>,
    /// Cursor contribution: change date, falling back to create date, start
    /// date, then `now`.
    pub cursor_date: DateTime<Utc>,
}

/// Merge one ERP record into the (possibly absent) stored consultation.
///
/// `bulk` marks the unfiltered queue-accounting pull: rows are created with
/// the `cl_all_` prefix and `ERP_ALL` source, only the queue-relevant fields
/// are maintained, and no chat fan-out is ever produced.
pub fn merge_consultation(
    existing: Option<&ConsultationRow>,
    record: &ErpConsultation,
    now: DateTime<Utc>,
    bulk: bool,
) -> Result<MergeOutcome, MergeError> {
    let ref_key =
        mappers::clean_uuid(record.ref_key.as_deref()).ok_or(MergeError::MissingRefKey)?;

    let client_key = mappers::clean_uuid(record.client_key.as_deref());
    let manager_key = mappers::clean_uuid(record.manager_key.as_deref());
    let author_key = mappers::clean_uuid(record.author_key.as_deref());
    let create_date = mappers::clean_datetime(record.create_date.as_deref());
    let start_date = mappers::clean_datetime(record.consultation_date.as_deref());
    let end_date = mappers::clean_datetime(record.end_date.as_deref());
    let change_date = mappers::clean_datetime(record.change_date.as_deref());

    let denied = !bulk && record.closed_without_consultation;
    let status = mappers::map_status(record.request_kind.as_deref(), end_date, denied);

    let comment = record
        .description
        .clone()
        .or_else(|| record.question.clone())
        .unwrap_or_default();
    let online_question_cat =
        mappers::clean_uuid(record.question_category_key.as_deref()).map(|u| u.to_string());
    let online_question =
        mappers::clean_uuid(record.consultation_question_key.as_deref()).map(|u| u.to_string());

    let cursor_date = change_date
        .or(create_date)
        .or(start_date)
        .unwrap_or(now);

    let Some(existing) = existing else {
        let cons_id = if bulk {
            ConsId::for_queue(ref_key)
        } else {
            ConsId::from_erp(ref_key)
        };
        let row = ConsultationRow {
            cons_id: cons_id.as_db_string(),
            cl_ref_key: Some(ref_key),
            number: record.number.clone(),
            status,
            consultation_type: ConsultationType::Accounting,
            denied,
            create_date: create_date.unwrap_or(now),
            start_date,
            end_date,
            redate: None,
            redate_time: None,
            client_key,
            client_id: None,
            org_inn: None,
            manager: manager_key.map(|k| k.to_string()),
            author: author_key.map(|k| k.to_string()),
            comment: if bulk { None } else { Some(comment) },
            online_question_cat,
            online_question,
            source: if bulk {
                ChangeSource::ErpAll.as_str().to_string()
            } else {
                ChangeSource::Erp.as_str().to_string()
            },
            con_blocks: None,
            con_calls: None,
            con_rates: None,
        };
        return Ok(MergeOutcome {
            row,
            ref_key,
            created: true,
            changed: true,
            status_change: None,
            fanout: None,
            manager_change: None,
            cursor_date,
        });
    };

    let mut row = existing.clone();
    let mut changed = false;
    let mut status_change = None;
    let mut fanout = None;
    let mut manager_change = None;

    if row.number != record.number && record.number.is_some() {
        row.number = record.number.clone();
        changed = true;
    }

    // Terminal statuses are sticky: the incoming ERP status is ignored, the
    // other fields still update.
    if !existing.status.is_terminal() && existing.status != status {
        status_change = Some((existing.status, status));
        row.status = status;
        changed = true;
        if !bulk {
            fanout = match status {
                ConsStatus::Closed => Some(StatusFanout::Close {
                    duration_minutes: mappers::call_duration_minutes(
                        start_date.or(existing.start_date),
                        end_date.or(existing.end_date),
                    ),
                    end_date: end_date.or(existing.end_date),
                }),
                ConsStatus::Open => Some(StatusFanout::SetOpen),
                ConsStatus::Pending => Some(StatusFanout::SetPending),
                _ => None,
            };
        }
    }

    if client_key.is_some() && row.client_key != client_key {
        row.client_key = client_key;
        changed = true;
    }

    // Everything served by this ERP is an accounting consultation; a row
    // first seen from the chat side gets reclassified once ERP claims it.
    if !bulk && row.consultation_type != ConsultationType::Accounting {
        row.consultation_type = ConsultationType::Accounting;
        changed = true;
    }

    if !bulk && row.denied != denied {
        row.denied = denied;
        changed = true;
    }

    if row.start_date != start_date {
        row.start_date = start_date;
        changed = true;
    }
    if row.end_date != end_date {
        row.end_date = end_date;
        changed = true;
    }

    if !bulk && !comment.is_empty() && row.comment.as_deref() != Some(comment.as_str()) {
        row.comment = Some(comment);
        changed = true;
    }

    // An ERP pull never nulls out a manager; clearing happens only through
    // an explicit webhook unassignment.
    let new_manager = manager_key.map(|k| k.to_string());
    if let Some(new_manager) = new_manager {
        if row.manager.as_deref() != Some(new_manager.as_str()) {
            manager_change = Some(ManagerChange {
                old: row.manager.clone(),
                new: new_manager.clone(),
            });
            row.manager = Some(new_manager);
            changed = true;
        }
    }

    if !bulk {
        if let Some(author) = author_key.map(|k| k.to_string()) {
            if row.author.as_deref() != Some(author.as_str()) {
                row.author = Some(author);
                changed = true;
            }
        }
        if let Some(cat) = online_question_cat {
            if row.online_question_cat.as_deref() != Some(cat.as_str()) {
                row.online_question_cat = Some(cat);
                changed = true;
            }
        }
        if let Some(q) = online_question {
            if row.online_question.as_deref() != Some(q.as_str()) {
                row.online_question = Some(q);
                changed = true;
            }
        }
    }

    Ok(MergeOutcome {
        row,
        ref_key,
        created: false,
        changed,
        status_change,
        fanout,
        manager_change,
        cursor_date,
    })
}

// ---------------------------------------------------------------------------
// Q&A extraction
// ---------------------------------------------------------------------------

/// Flatten both line arrays into the replacement Q&A set. Consultation lines
/// keep their own numbering; the plain question/answer array is renumbered
/// from [`QA_SECOND_ARRAY_BASE`] so the two cannot collide.
pub fn qa_rows(record: &ErpConsultation) -> Vec<QaRow> {
    let mut rows = Vec::with_capacity(
        record.consultation_lines.len() + record.question_answers.len(),
    );

    for (idx, line) in record.consultation_lines.iter().enumerate() {
        rows.push(QaRow {
            line_number: line.line_number.unwrap_or(idx as i64 + 1),
            po_type_key: mappers::clean_uuid(line.po_type_key.as_deref()),
            po_section_key: mappers::clean_uuid(line.po_section_key.as_deref()),
            con_blocks_key: mappers::clean_uuid(line.blocking_key.as_deref()),
            manager_help_key: mappers::clean_uuid(line.manager_help_key.as_deref()),
            is_repeat: line.is_repeat,
            question: line.question.clone(),
            answer: line.answer.clone(),
        });
    }

    for (idx, qa) in record.question_answers.iter().enumerate() {
        rows.push(QaRow {
            line_number: QA_SECOND_ARRAY_BASE + idx as i64,
            question: qa.question.clone(),
            answer: qa.answer.clone(),
            ..Default::default()
        });
    }

    rows
}

// ---------------------------------------------------------------------------
// Custom-attribute mirror
// ---------------------------------------------------------------------------

/// The fixed field subset mirrored to chat custom attributes.
pub fn build_mirror(row: &ConsultationRow) -> MirroredAttributes {
    MirroredAttributes {
        number_con: row.number.clone(),
        date_con: row.start_date.map(|d| attr_datetime(&d.naive_utc())),
        con_end: row.end_date.map(|d| attr_datetime(&d.naive_utc())),
        redate_con: row
            .redate
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| attr_datetime(&d)),
        retime_con: row.redate_time.map(|t| t.format("%H:%M").to_string()),
        consultation_type: Some(row.consultation_type.as_str().to_string()),
        closed_without_con: Some(row.denied),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cmw_schemas::ErpQuestionAnswer;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
    }

    fn record(ref_key: &str) -> ErpConsultation {
        ErpConsultation {
            ref_key: Some(ref_key.to_string()),
            number: Some("CL-7".to_string()),
            request_kind: Some(mappers::KIND_ACCOUNTING.to_string()),
            ..Default::default()
        }
    }

    const KEY: &str = "15d38cda-1812-11ef-b824-c67597d01fa8";
    const MANAGER: &str = "25d38cda-1812-11ef-b824-c67597d01fa8";

    #[test]
    fn creates_with_synthetic_id_and_erp_source() {
        let out = merge_consultation(None, &record(KEY), now(), false).unwrap();
        assert!(out.created);
        assert_eq!(out.row.cons_id, format!("cl_{KEY}"));
        assert_eq!(out.row.source, "ERP");
        assert_eq!(out.row.status, ConsStatus::Open);

        let bulk = merge_consultation(None, &record(KEY), now(), true).unwrap();
        assert_eq!(bulk.row.cons_id, format!("cl_all_{KEY}"));
        assert_eq!(bulk.row.source, "ERP_ALL");
    }

    #[test]
    fn merge_is_idempotent() {
        let rec = record(KEY);
        let first = merge_consultation(None, &rec, now(), false).unwrap();
        let second = merge_consultation(Some(&first.row), &rec, now(), false).unwrap();
        assert!(!second.created);
        assert!(!second.changed, "re-merging an unchanged record must be a no-op");
        assert!(second.fanout.is_none());
        assert!(second.manager_change.is_none());
    }

    #[test]
    fn terminal_status_is_never_downgraded() {
        let rec = record(KEY);
        let mut stored = merge_consultation(None, &rec, now(), false).unwrap().row;
        stored.status = ConsStatus::Resolved;

        // The incoming record says "open"; the status must stay resolved,
        // other fields still update.
        let mut changed_rec = record(KEY);
        changed_rec.number = Some("CL-8".to_string());
        let out = merge_consultation(Some(&stored), &changed_rec, now(), false).unwrap();
        assert_eq!(out.row.status, ConsStatus::Resolved);
        assert!(out.status_change.is_none());
        assert!(out.fanout.is_none());
        assert_eq!(out.row.number.as_deref(), Some("CL-8"));
        assert!(out.changed);
    }

    #[test]
    fn close_fanout_carries_call_duration() {
        let rec = record(KEY);
        let stored = merge_consultation(None, &rec, now(), false).unwrap().row;

        let mut closing = record(KEY);
        closing.consultation_date = Some("2025-03-02T10:00:00".to_string());
        closing.end_date = Some("2025-03-02T10:15:00".to_string());

        let out = merge_consultation(Some(&stored), &closing, now(), false).unwrap();
        assert_eq!(out.row.status, ConsStatus::Closed);
        assert_eq!(
            out.fanout,
            Some(StatusFanout::Close {
                duration_minutes: Some(15),
                end_date: mappers::clean_datetime(Some("2025-03-02T10:15:00")),
            })
        );
    }

    #[test]
    fn denied_forces_cancelled_even_with_end_date() {
        let rec = record(KEY);
        let stored = merge_consultation(None, &rec, now(), false).unwrap().row;

        let mut denied_rec = record(KEY);
        denied_rec.end_date = Some("2025-03-02T10:15:00".to_string());
        denied_rec.closed_without_consultation = true;

        let out = merge_consultation(Some(&stored), &denied_rec, now(), false).unwrap();
        assert_eq!(out.row.status, ConsStatus::Cancelled);
        assert!(out.row.denied);
    }

    #[test]
    fn manager_is_never_nulled_by_a_pull() {
        let mut rec = record(KEY);
        rec.manager_key = Some(MANAGER.to_string());
        let stored = merge_consultation(None, &rec, now(), false).unwrap().row;
        assert_eq!(stored.manager.as_deref(), Some(MANAGER));

        // The next record carries no manager; the stored one survives and no
        // change is reported.
        let out = merge_consultation(Some(&stored), &record(KEY), now(), false).unwrap();
        assert_eq!(out.row.manager.as_deref(), Some(MANAGER));
        assert!(out.manager_change.is_none());
        assert!(!out.changed);
    }

    #[test]
    fn manager_change_reports_old_and_new() {
        let mut rec = record(KEY);
        rec.manager_key = Some(MANAGER.to_string());
        let stored = merge_consultation(None, &rec, now(), false).unwrap().row;

        let other = "35d38cda-1812-11ef-b824-c67597d01fa8";
        let mut reassigned = record(KEY);
        reassigned.manager_key = Some(other.to_string());
        let out = merge_consultation(Some(&stored), &reassigned, now(), false).unwrap();
        let change = out.manager_change.unwrap();
        assert_eq!(change.old.as_deref(), Some(MANAGER));
        assert_eq!(change.new, other);
    }

    #[test]
    fn cursor_falls_back_through_dates() {
        let mut rec = record(KEY);
        rec.change_date = Some("2025-03-05T08:00:00".to_string());
        let out = merge_consultation(None, &rec, now(), false).unwrap();
        assert_eq!(
            out.cursor_date,
            mappers::clean_datetime(Some("2025-03-05T08:00:00")).unwrap()
        );

        let bare = record(KEY);
        let out = merge_consultation(None, &bare, now(), false).unwrap();
        assert_eq!(out.cursor_date, now());
    }

    #[test]
    fn qa_second_array_renumbers_from_one_thousand() {
        let mut rec = record(KEY);
        rec.consultation_lines.push(cmw_schemas::ErpConsultationLine {
            line_number: Some(1),
            question: Some("q1".to_string()),
            ..Default::default()
        });
        rec.question_answers = vec![
            ErpQuestionAnswer {
                line_number: Some(1),
                question: Some("plain".to_string()),
                answer: None,
            },
            ErpQuestionAnswer {
                line_number: Some(2),
                question: Some("plain2".to_string()),
                answer: None,
            },
        ];

        let rows = qa_rows(&rec);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].line_number, 1);
        assert_eq!(rows[1].line_number, 1000);
        assert_eq!(rows[2].line_number, 1001);
    }

    #[test]
    fn mirror_contains_the_fixed_subset() {
        let mut rec = record(KEY);
        rec.consultation_date = Some("2025-03-02T10:00:00".to_string());
        let mut row = merge_consultation(None, &rec, now(), false).unwrap().row;
        row.redate = chrono::NaiveDate::from_ymd_opt(2025, 3, 4);
        row.redate_time = chrono::NaiveTime::from_hms_opt(12, 0, 0);

        let mirror = build_mirror(&row);
        assert_eq!(mirror.number_con.as_deref(), Some("CL-7"));
        assert_eq!(mirror.date_con.as_deref(), Some("2025-03-02T10:00:00"));
        assert_eq!(mirror.redate_con.as_deref(), Some("2025-03-04T00:00:00"));
        assert_eq!(mirror.retime_con.as_deref(), Some("12:00"));
        assert_eq!(mirror.consultation_type.as_deref(), Some("accounting"));
        assert_eq!(mirror.closed_without_con, Some(false));
    }
}
