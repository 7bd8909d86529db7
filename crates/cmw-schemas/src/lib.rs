//! Shared domain and wire types for the consultation sync middleware.
//!
//! Everything here is plain data: enums with `as_str`/`parse` pairs, the
//! tagged consultation id, ERP record payloads as they come off the OData
//! wire, and chat webhook payloads. No IO, no store access.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod erp;
pub mod webhook;

pub use erp::*;
pub use webhook::*;

// ---------------------------------------------------------------------------
// ConsStatus
// ---------------------------------------------------------------------------

/// Consultation lifecycle status as stored in `cons.cons.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsStatus {
    New,
    Pending,
    Open,
    Other,
    Closed,
    Resolved,
    Cancelled,
}

impl ConsStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsStatus::New => "new",
            ConsStatus::Pending => "pending",
            ConsStatus::Open => "open",
            ConsStatus::Other => "other",
            ConsStatus::Closed => "closed",
            ConsStatus::Resolved => "resolved",
            ConsStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(ConsStatus::New),
            "pending" => Some(ConsStatus::Pending),
            "open" => Some(ConsStatus::Open),
            "other" => Some(ConsStatus::Other),
            "closed" => Some(ConsStatus::Closed),
            "resolved" => Some(ConsStatus::Resolved),
            "cancelled" => Some(ConsStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses are sticky: an ERP pull never downgrades them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConsStatus::Closed | ConsStatus::Resolved | ConsStatus::Cancelled
        )
    }

    /// Statuses that count toward an operator's queue.
    pub fn is_queued(&self) -> bool {
        matches!(self, ConsStatus::Pending | ConsStatus::Open)
    }
}

impl std::fmt::Display for ConsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ConsultationType
// ---------------------------------------------------------------------------

/// Business line of a consultation. Accounting consultations are subject to
/// the terminal-status guard and the client-closure refusal; tech support has
/// no queue semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsultationType {
    Accounting,
    TechSupport,
}

impl ConsultationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsultationType::Accounting => "accounting",
            ConsultationType::TechSupport => "tech_support",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accounting" => Some(ConsultationType::Accounting),
            "tech_support" => Some(ConsultationType::TechSupport),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConsultationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ChangeSource
// ---------------------------------------------------------------------------

/// Origin tag for consultation rows and change-log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeSource {
    Etl,
    Erp,
    ErpAll,
    Chat,
    Api,
}

impl ChangeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeSource::Etl => "ETL",
            ChangeSource::Erp => "ERP",
            ChangeSource::ErpAll => "ERP_ALL",
            ChangeSource::Chat => "CHAT",
            ChangeSource::Api => "API",
        }
    }
}

impl std::fmt::Display for ChangeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ConsId
// ---------------------------------------------------------------------------

/// Tagged consultation id.
///
/// ERP and the chat platform have disjoint key spaces: the chat platform
/// assigns short numeric conversation ids, while ERP documents carry UUIDs.
/// A consultation created from an ERP pull starts with a synthetic
/// `cl_<uuid>` id until the webhook reconciler stitches in the real chat id.
/// Bulk-pulled rows used only for queue math carry `cl_all_<uuid>` and are
/// never synced to chat.
///
/// Only the `Chat` variant is a valid target for chat API calls; the parse
/// rules (all digits, at most 10 chars) match what the chat platform actually
/// hands out.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConsId {
    /// Numeric chat conversation id.
    Chat(u64),
    /// Synthetic `cl_<uuid>` placeholder for an ERP-born consultation.
    Erp(Uuid),
    /// Synthetic `cl_all_<uuid>` row pulled for queue accounting only.
    ErpAll(Uuid),
    /// Anything else found in the store (legacy `temp_` ids and the like).
    Opaque(String),
}

impl ConsId {
    const MAX_CHAT_DIGITS: usize = 10;

    /// Classify a stored `cons_id` string.
    pub fn parse(s: &str) -> ConsId {
        if let Some(rest) = s.strip_prefix("cl_all_") {
            if let Ok(u) = Uuid::parse_str(rest) {
                return ConsId::ErpAll(u);
            }
        } else if let Some(rest) = s.strip_prefix("cl_") {
            if let Ok(u) = Uuid::parse_str(rest) {
                return ConsId::Erp(u);
            }
        }
        if !s.is_empty()
            && s.len() <= Self::MAX_CHAT_DIGITS
            && s.bytes().all(|b| b.is_ascii_digit())
        {
            if let Ok(n) = s.parse::<u64>() {
                return ConsId::Chat(n);
            }
        }
        ConsId::Opaque(s.to_string())
    }

    /// Synthetic id for a consultation first seen in an ERP pull.
    pub fn from_erp(ref_key: Uuid) -> ConsId {
        ConsId::Erp(ref_key)
    }

    /// Synthetic id for a bulk-pulled queue-accounting row.
    pub fn for_queue(ref_key: Uuid) -> ConsId {
        ConsId::ErpAll(ref_key)
    }

    /// The numeric chat conversation id, when this id is syncable to chat.
    pub fn chat_id(&self) -> Option<u64> {
        match self {
            ConsId::Chat(n) => Some(*n),
            _ => None,
        }
    }

    /// True only for real chat conversation ids; synthetic and opaque ids
    /// silently skip all chat sync.
    pub fn is_chat(&self) -> bool {
        matches!(self, ConsId::Chat(_))
    }

    /// Canonical storage form.
    pub fn as_db_string(&self) -> String {
        match self {
            ConsId::Chat(n) => n.to_string(),
            ConsId::Erp(u) => format!("cl_{u}"),
            ConsId::ErpAll(u) => format!("cl_all_{u}"),
            ConsId::Opaque(s) => s.clone(),
        }
    }
}

impl std::fmt::Display for ConsId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_db_string())
    }
}

// ---------------------------------------------------------------------------
// Mirrored custom attributes
// ---------------------------------------------------------------------------

/// The fixed subset of consultation fields mirrored to chat conversation
/// custom attributes. Only set fields are included in the outbound patch
/// (partial merge by key on the chat side).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MirroredAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_con: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_con: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub con_end: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redate_con: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retime_con: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consultation_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_without_con: Option<bool>,
}

impl MirroredAttributes {
    pub fn is_empty(&self) -> bool {
        *self == MirroredAttributes::default()
    }

    /// Flatten into the key/value map the chat custom-attribute endpoint
    /// expects.
    pub fn to_patch(&self) -> serde_json::Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Per-entity sync cursor loaded from `sys.sync_state`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Checkpoint {
    /// Timestamp cursor. Never advanced past the wall clock at save time.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Opaque key cursor, used where the source timestamp is unreliable
    /// (ratings order by key).
    pub last_synced_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Helpers shared by tests and fixtures
// ---------------------------------------------------------------------------

/// Format a timestamp the way ERP's OData dialect expects inside
/// `datetime'...'` literals.
pub fn odata_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Format a naive timestamp for chat custom attributes (`date_con` et al).
pub fn attr_datetime(dt: &NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cons_id_classification() {
        let u = Uuid::parse_str("15d38cda-1812-11ef-b824-c67597d01fa8").unwrap();

        assert_eq!(ConsId::parse("12345"), ConsId::Chat(12345));
        assert_eq!(
            ConsId::parse(&format!("cl_{u}")),
            ConsId::Erp(u),
        );
        assert_eq!(
            ConsId::parse(&format!("cl_all_{u}")),
            ConsId::ErpAll(u),
        );
        assert_eq!(
            ConsId::parse(&u.to_string()),
            ConsId::Opaque(u.to_string()),
        );
    }

    #[test]
    fn chat_id_requires_ten_digits_or_fewer() {
        assert!(ConsId::parse("1234567890").is_chat());
        assert!(!ConsId::parse("12345678901").is_chat());
        assert!(!ConsId::parse("").is_chat());
        assert!(!ConsId::parse("temp_991").is_chat());
        assert!(!ConsId::parse("12a45").is_chat());
    }

    #[test]
    fn cons_id_round_trips_through_db_string() {
        for raw in ["42", "cl_15d38cda-1812-11ef-b824-c67597d01fa8", "temp_9"] {
            assert_eq!(ConsId::parse(raw).as_db_string(), raw);
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(ConsStatus::Closed.is_terminal());
        assert!(ConsStatus::Resolved.is_terminal());
        assert!(ConsStatus::Cancelled.is_terminal());
        assert!(!ConsStatus::Open.is_terminal());
        assert!(!ConsStatus::Pending.is_terminal());
    }

    #[test]
    fn status_round_trip() {
        for s in [
            ConsStatus::New,
            ConsStatus::Pending,
            ConsStatus::Open,
            ConsStatus::Other,
            ConsStatus::Closed,
            ConsStatus::Resolved,
            ConsStatus::Cancelled,
        ] {
            assert_eq!(ConsStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ConsStatus::parse("snoozed"), None);
    }

    #[test]
    fn mirrored_attributes_patch_skips_unset_fields() {
        let attrs = MirroredAttributes {
            number_con: Some("A-17".to_string()),
            closed_without_con: Some(false),
            ..Default::default()
        };
        let patch = attrs.to_patch();
        assert_eq!(patch.len(), 2);
        assert_eq!(patch["number_con"], "A-17");
        assert_eq!(patch["closed_without_con"], false);
    }
}
