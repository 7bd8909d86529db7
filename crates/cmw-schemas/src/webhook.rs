//! Chat webhook payloads.
//!
//! The chat platform posts `{event, data: {conversation | message}}`. The
//! `assignee` and `status` keys use a double-`Option`: the outer level is
//! whether the key was present in the payload at all, the inner level is
//! whether the value was null. The reconciler treats "absent" and
//! "explicitly null" differently for assignees.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: WebhookData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookData {
    #[serde(default)]
    pub conversation: Option<WebhookConversation>,
    #[serde(default)]
    pub message: Option<WebhookMessage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConversation {
    pub id: Option<u64>,
    /// Present iff the key was in the payload; inner `None` means JSON null.
    #[serde(default, deserialize_with = "some_nullable")]
    pub status: Option<Option<String>>,
    /// Present iff the key was in the payload; inner `None` means unassigned.
    #[serde(default, deserialize_with = "some_nullable")]
    pub assignee: Option<Option<WebhookAssignee>>,
    #[serde(default)]
    pub custom_attributes: Option<serde_json::Map<String, Value>>,
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookAssignee {
    pub id: Option<u64>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookMessage {
    pub id: Option<u64>,
    pub conversation_id: Option<u64>,
    pub content: Option<String>,
    pub message_type: Option<Value>,
}

/// Response body returned for every accepted webhook.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WebhookResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        WebhookResponse {
            status: "ok",
            message: Some(message.into()),
        }
    }
}

/// Deserialize a field so that a present-but-null key becomes `Some(None)`.
/// Combined with `#[serde(default)]`, an absent key stays `None`.
fn some_nullable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Ok(Some(Option::<T>::deserialize(deserializer)?))
}

/// Webhook event names the reconciler understands.
pub mod events {
    pub const CONVERSATION_CREATED: &str = "conversation.created";
    pub const CONVERSATION_UPDATED: &str = "conversation.updated";
    pub const CONVERSATION_STATUS_CHANGED: &str = "conversation.status_changed";
    pub const CONVERSATION_RESOLVED: &str = "conversation.resolved";
    pub const MESSAGE_CREATED: &str = "message.created";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_assignee_differs_from_null_assignee() {
        let absent: WebhookConversation = serde_json::from_str(r#"{"id": 7}"#).unwrap();
        assert!(absent.assignee.is_none());

        let null: WebhookConversation =
            serde_json::from_str(r#"{"id": 7, "assignee": null}"#).unwrap();
        assert_eq!(null.assignee.as_ref().map(|a| a.is_none()), Some(true));

        let set: WebhookConversation =
            serde_json::from_str(r#"{"id": 7, "assignee": {"id": 3, "name": "A"}}"#).unwrap();
        let inner = set.assignee.unwrap().unwrap();
        assert_eq!(inner.id, Some(3));
    }

    #[test]
    fn envelope_decodes_status_change() {
        let raw = r#"{
            "event": "conversation.status_changed",
            "data": {"conversation": {"id": 12, "status": "resolved"}}
        }"#;
        let env: WebhookEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.event, events::CONVERSATION_STATUS_CHANGED);
        let conv = env.data.conversation.unwrap();
        assert_eq!(conv.status, Some(Some("resolved".to_string())));
    }
}
