//! OData client for the ERP side.
//!
//! Read path: filter-URL construction with an OData-safe percent-encoding
//! set, paged GETs with capped exponential backoff and retry classification.
//! Write path: a narrow consultation PATCH used only from background tasks
//! and the reschedule flow.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use tracing::{error, warn};
use uuid::Uuid;

use cmw_schemas::{odata_datetime, OdataPage};

pub mod entities {
    //! ERP entity names served by the OData endpoint.
    pub const CONSULTATION_DOC: &str = "ConsultationDoc";
    pub const CALL_REGISTER: &str = "CallRegister";
    pub const RESCHED_REGISTER: &str = "ReschedRegister";
    pub const RATING_REGISTER: &str = "RatingRegister";
    pub const QUEUE_CLOSING_REGISTER: &str = "QueueClosingRegister";
    pub const USER_CATALOG: &str = "UserCatalog";
    pub const DEPARTMENT_CATALOG: &str = "DepartmentCatalog";
    pub const USER_DEPARTMENT_REGISTER: &str = "UserDepartmentRegister";
    pub const USER_LANGUAGE_REGISTER: &str = "UserLanguageRegister";
    pub const CONSULTANT_LIST_REGISTER: &str = "ConsultantListRegister";
    pub const USER_CATEGORY_REGISTER: &str = "UserCategoryRegister";

    /// Checkpoint name for the bulk (unfiltered) consultation pull. Same
    /// source entity, separate cursor.
    pub const CONSULTATION_DOC_ALL: &str = "ConsultationDoc_ALL";
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Characters kept verbatim inside `$filter` / `$orderby` values.
///
/// OData punctuation `'()=<>`, spaces as `%20` (not `+`), commas for orderby
/// lists, and the usual unreserved marks. Non-ASCII field names go through
/// UTF-8 percent-encoding.
const ODATA_SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'=')
    .remove(b'<')
    .remove(b'>')
    .remove(b',')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.');

/// Percent-encode a filter or orderby clause.
pub fn encode_clause(clause: &str) -> String {
    utf8_percent_encode(clause, ODATA_SAFE).to_string()
}

/// `Field ge datetime'YYYY-MM-DDTHH:MM:SS'`
pub fn filter_ge_datetime(field: &str, from: &DateTime<Utc>) -> String {
    format!("{field} ge datetime'{}'", odata_datetime(from))
}

/// `Ref_Key eq guid'…' or Ref_Key eq guid'…' or …`
///
/// GUIDs must never be compared with gt/lt — only equality batches are legal.
pub fn filter_ref_key_batch(keys: &[Uuid]) -> String {
    keys.iter()
        .map(|k| format!("Ref_Key eq guid'{k}'"))
        .collect::<Vec<_>>()
        .join(" or ")
}

/// Query parameters for one paged collection request.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filter: Option<String>,
    pub orderby: Option<String>,
    pub top: i64,
    pub skip: i64,
}

/// Build the full collection URL:
/// `<base>/<Entity>?$format=json&$filter=<f>&$orderby=<o>&$top=<N>&$skip=<K>`.
pub fn collection_url(base_url: &str, entity: &str, query: &Query) -> String {
    let base = base_url.trim_end_matches('/');
    let mut url = format!("{base}/{entity}?$format=json");
    if let Some(filter) = &query.filter {
        url.push_str("&$filter=");
        url.push_str(&encode_clause(filter));
    }
    if let Some(orderby) = &query.orderby {
        url.push_str("&$orderby=");
        url.push_str(&encode_clause(orderby));
    }
    url.push_str(&format!("&$top={}&$skip={}", query.top, query.skip));
    url
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the OData client after retries are exhausted.
#[derive(Debug)]
pub enum OdataError {
    /// Network or timeout failure (retries exhausted).
    Transport(String),
    /// Terminal HTTP status. `retryable` records whether the status was in
    /// the retry class (and simply ran out of attempts) or a hard 4xx.
    Status {
        status: u16,
        body: String,
        retryable: bool,
    },
    /// A response body could not be decoded.
    Decode(String),
}

impl OdataError {
    /// A `400` on a filter string is a character-encoding regression, not an
    /// upstream hiccup; callers stop the process on it.
    pub fn is_bad_request(&self) -> bool {
        matches!(self, OdataError::Status { status: 400, .. })
    }
}

impl fmt::Display for OdataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OdataError::Transport(msg) => write!(f, "odata transport error: {msg}"),
            OdataError::Status {
                status,
                body,
                retryable,
            } => write!(
                f,
                "odata http {status} ({}): {body}",
                if *retryable { "retries exhausted" } else { "no retry" }
            ),
            OdataError::Decode(msg) => write!(f, "odata decode error: {msg}"),
        }
    }
}

impl std::error::Error for OdataError {}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 504)
}

/// Capped exponential backoff: `min(2^attempt, 60)` seconds.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs((1u64 << attempt.min(6)).min(60))
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

const MAX_RETRIES: u32 = 6;

/// Stateless OData client over a shared reqwest connection pool.
#[derive(Clone)]
pub struct OdataClient {
    http: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
}

impl OdataClient {
    pub fn new(
        base_url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, OdataError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("cons-middleware/1.0")
            .build()
            .map_err(|e| OdataError::Transport(e.to_string()))?;
        Ok(OdataClient {
            http,
            base_url: base_url.into(),
            user: user.into(),
            password: password.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch one page of a collection.
    pub async fn fetch_page<T: DeserializeOwned>(
        &self,
        entity: &str,
        query: &Query,
    ) -> Result<Vec<T>, OdataError> {
        let url = collection_url(&self.base_url, entity, query);
        let body = self.get_with_backoff(&url).await?;
        let page: OdataPage<T> = serde_json::from_str(&body).map_err(|e| {
            OdataError::Decode(format!("{e} (body: {})", snippet(&body, 500)))
        })?;
        Ok(page.value)
    }

    /// GET with retry on 429/502/503/504 and transport errors; other 4xx are
    /// terminal and carry the response body.
    async fn get_with_backoff(&self, url: &str) -> Result<String, OdataError> {
        let mut attempt: u32 = 0;
        loop {
            let result = self
                .http
                .get(url)
                .basic_auth(&self.user, Some(&self.password))
                .header("Accept", "application/json")
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if (400..500).contains(&status) && status != 429 {
                        let body = resp.text().await.unwrap_or_default();
                        error!(status, url = snippet(url, 500), body = snippet(&body, 1000), "odata client error (no retry)");
                        return Err(OdataError::Status {
                            status,
                            body: snippet(&body, 1000).to_string(),
                            retryable: false,
                        });
                    }
                    if is_retryable_status(status) {
                        if attempt >= MAX_RETRIES {
                            let body = resp.text().await.unwrap_or_default();
                            return Err(OdataError::Status {
                                status,
                                body: snippet(&body, 1000).to_string(),
                                retryable: true,
                            });
                        }
                        let wait = backoff_delay(attempt);
                        warn!(status, wait_secs = wait.as_secs(), attempt = attempt + 1, "odata retry");
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                        continue;
                    }
                    if !resp.status().is_success() {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(OdataError::Status {
                            status,
                            body: snippet(&body, 1000).to_string(),
                            retryable: false,
                        });
                    }
                    return resp
                        .text()
                        .await
                        .map_err(|e| OdataError::Transport(e.to_string()));
                }
                Err(e) => {
                    if attempt >= MAX_RETRIES {
                        error!(url = snippet(url, 500), error = %e, "odata transport error after retries");
                        return Err(OdataError::Transport(e.to_string()));
                    }
                    let wait = backoff_delay(attempt);
                    warn!(error = %e, wait_secs = wait.as_secs(), attempt = attempt + 1, "odata transport retry");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Narrow write path: PATCH a consultation document. Only the status
    /// code, manager key, and start date are writable from this side.
    pub async fn update_consultation(
        &self,
        ref_key: Uuid,
        patch: &ConsultationPatch,
    ) -> Result<(), OdataError> {
        if patch.is_empty() {
            return Ok(());
        }

        let base = self.base_url.trim_end_matches('/');
        let url = format!(
            "{base}/{}(guid'{ref_key}')?$format=json",
            entities::CONSULTATION_DOC
        );

        let mut body = serde_json::Map::new();
        if let Some(status) = &patch.status {
            body.insert("StatusCode".to_string(), status.as_str().into());
        }
        if let Some(manager_key) = patch.manager_key {
            body.insert("Manager_Key".to_string(), manager_key.to_string().into());
        }
        if let Some(start_date) = patch.start_date {
            body.insert(
                "ConsultationDate".to_string(),
                odata_datetime(&start_date).into(),
            );
        }

        let resp = self
            .http
            .patch(&url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&serde_json::Value::Object(body))
            .send()
            .await
            .map_err(|e| OdataError::Transport(e.to_string()))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(OdataError::Status {
                status,
                body: snippet(&body, 1000).to_string(),
                retryable: is_retryable_status(status),
            });
        }
        Ok(())
    }
}

/// ERP-side status codes for the consultation write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErpStatusCode {
    New,
    InProgress,
    Closed,
    /// Pass-through for statuses with no dedicated ERP code.
    Verbatim(&'static str),
}

impl ErpStatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErpStatusCode::New => "new",
            ErpStatusCode::InProgress => "in_progress",
            ErpStatusCode::Closed => "closed",
            ErpStatusCode::Verbatim(s) => s,
        }
    }
}

/// Fields accepted by [`OdataClient::update_consultation`].
#[derive(Debug, Clone, Default)]
pub struct ConsultationPatch {
    pub status: Option<ErpStatusCode>,
    pub manager_key: Option<Uuid>,
    pub start_date: Option<DateTime<Utc>>,
}

impl ConsultationPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.manager_key.is_none() && self.start_date.is_none()
    }
}

fn snippet(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn encoding_preserves_odata_punctuation() {
        let clause = "ChangeDate ge datetime'2025-01-01T00:00:00'";
        let encoded = encode_clause(clause);
        assert!(encoded.contains("'"));
        assert!(encoded.contains("%20ge%20"));
        assert!(!encoded.contains('+'));
    }

    #[test]
    fn encoding_utf8_percent_encodes_non_ascii() {
        let encoded = encode_clause("Département eq 'été'");
        // 'é' is UTF-8 0xC3 0xA9.
        assert!(encoded.contains("%C3%A9"));
        assert!(encoded.contains('\''));
    }

    #[test]
    fn collection_url_shape() {
        let query = Query {
            filter: Some("ChangeDate ge datetime'2025-01-01T00:00:00'".to_string()),
            orderby: Some("ChangeDate asc".to_string()),
            top: 1000,
            skip: 2000,
        };
        let url = collection_url("http://erp.local/odata/", entities::CONSULTATION_DOC, &query);
        assert!(url.starts_with("http://erp.local/odata/ConsultationDoc?$format=json&$filter="));
        assert!(url.ends_with("&$top=1000&$skip=2000"));
        assert!(url.contains("&$orderby=ChangeDate%20asc"));
    }

    #[test]
    fn ref_key_batch_uses_guid_equality_only() {
        let a = Uuid::parse_str("15d38cda-1812-11ef-b824-c67597d01fa8").unwrap();
        let b = Uuid::parse_str("25d38cda-1812-11ef-b824-c67597d01fa8").unwrap();
        let f = filter_ref_key_batch(&[a, b]);
        assert_eq!(
            f,
            format!("Ref_Key eq guid'{a}' or Ref_Key eq guid'{b}'")
        );
        assert!(!f.contains(" gt "));
        assert!(!f.contains(" lt "));
    }

    #[test]
    fn filter_ge_datetime_format() {
        let dt = Utc.with_ymd_and_hms(2025, 3, 2, 10, 15, 0).unwrap();
        assert_eq!(
            filter_ge_datetime("ChangeDate", &dt),
            "ChangeDate ge datetime'2025-03-02T10:15:00'"
        );
    }

    #[test]
    fn backoff_is_capped_at_sixty_seconds() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(6), Duration::from_secs(60));
        assert_eq!(backoff_delay(20), Duration::from_secs(60));
    }

    #[test]
    fn empty_patch_is_detected() {
        assert!(ConsultationPatch::default().is_empty());
        let p = ConsultationPatch {
            status: Some(ErpStatusCode::Closed),
            ..Default::default()
        };
        assert!(!p.is_empty());
    }
}
