//! Typed wrapper over the chat platform's REST API.
//!
//! All conversation-facing operations take the numeric conversation id; the
//! caller is responsible for never passing a synthetic id (see
//! `ConsId::is_chat`). Two platform quirks are absorbed here:
//!
//! - 404 on a conversation update is demoted to a warning — the conversation
//!   was deleted on the remote side and there is nothing left to sync;
//! - 422 on user creation means "e-mail already taken" and is surfaced as
//!   [`CreateUserOutcome::AlreadyExists`] so the caller re-runs its lookups.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::warn;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ChatError {
    Transport(String),
    Status { status: u16, body: String },
    Decode(String),
}

impl ChatError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ChatError::Status { status: 404, .. })
    }

    pub fn is_unprocessable(&self) -> bool {
        matches!(self, ChatError::Status { status: 422, .. })
    }
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::Transport(msg) => write!(f, "chat transport error: {msg}"),
            ChatError::Status { status, body } => write!(f, "chat http {status}: {body}"),
            ChatError::Decode(msg) => write!(f, "chat decode error: {msg}"),
        }
    }
}

impl std::error::Error for ChatError {}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Partial conversation update. `assignee_id: Some(None)` clears the
/// assignee; `None` leaves it untouched.
#[derive(Debug, Clone, Default)]
pub struct ConversationUpdate {
    pub status: Option<String>,
    pub assignee_id: Option<Option<u64>>,
}

impl ConversationUpdate {
    pub fn status(status: impl Into<String>) -> Self {
        ConversationUpdate {
            status: Some(status.into()),
            ..Default::default()
        }
    }

    pub fn clear_assignee() -> Self {
        ConversationUpdate {
            assignee_id: Some(None),
            ..Default::default()
        }
    }

    fn to_body(&self) -> Value {
        let mut body = Map::new();
        if let Some(status) = &self.status {
            body.insert("status".to_string(), status.clone().into());
        }
        if let Some(assignee) = &self.assignee_id {
            body.insert(
                "assignee_id".to_string(),
                assignee.map(Value::from).unwrap_or(Value::Null),
            );
        }
        Value::Object(body)
    }
}

/// An agent as returned by the agent list endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatAgent {
    pub id: Option<u64>,
    pub name: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub custom_attributes: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default)]
pub struct NewChatUser {
    pub name: String,
    pub email: String,
    pub custom_attributes: Option<Map<String, Value>>,
}

#[derive(Debug, Clone)]
pub enum CreateUserOutcome {
    Created(ChatAgent),
    /// 422 from the platform: the e-mail is already registered. Look the
    /// user up instead of treating this as a failure.
    AlreadyExists,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Chat platform operations used by the sync layers. The HTTP client
/// implements this; the testkit provides a recording fake.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Partial conversation update. 404 is demoted to a warning.
    async fn update_conversation(
        &self,
        conversation_id: u64,
        update: &ConversationUpdate,
    ) -> Result<(), ChatError>;

    /// Dedicated status-toggle endpoint, used for resolve/reopen.
    async fn toggle_conversation_status(
        &self,
        conversation_id: u64,
        status: &str,
    ) -> Result<(), ChatError>;

    /// The only correct way to reassign an agent (distinct endpoint from
    /// `update_conversation`).
    async fn assign_conversation_agent(
        &self,
        conversation_id: u64,
        assignee_id: u64,
    ) -> Result<(), ChatError>;

    /// Partial merge of custom attributes by key. 404 is demoted to a warning.
    async fn update_conversation_custom_attributes(
        &self,
        conversation_id: u64,
        attributes: &Map<String, Value>,
    ) -> Result<(), ChatError>;

    /// Client-visible outgoing message. Always used instead of private notes
    /// for user-facing signals.
    async fn send_message(&self, conversation_id: u64, content: &str) -> Result<(), ChatError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<ChatAgent>, ChatError>;

    async fn find_user_by_custom_attribute(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Option<ChatAgent>, ChatError>;

    async fn list_all_agents(&self) -> Result<Vec<ChatAgent>, ChatError>;

    async fn create_user(&self, user: &NewChatUser) -> Result<CreateUserOutcome, ChatError>;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    account_id: String,
    api_token: String,
}

impl ChatClient {
    pub fn new(
        base_url: impl Into<String>,
        account_id: impl Into<String>,
        api_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ChatError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("cons-middleware/1.0")
            .build()
            .map_err(|e| ChatError::Transport(e.to_string()))?;
        Ok(ChatClient {
            http,
            base_url: base_url.into(),
            account_id: account_id.into(),
            api_token: api_token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/api/v1/accounts/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.account_id,
            path
        )
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, ChatError> {
        let mut req = self
            .http
            .request(method, self.url(path))
            .header("api_access_token", &self.api_token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;
        if !(200..300).contains(&status) {
            return Err(ChatError::Status {
                status,
                body: text.chars().take(500).collect(),
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ChatError::Decode(e.to_string()))
    }

    /// Demote a 404 to a warning; the conversation is gone on the remote side.
    fn absorb_not_found(
        result: Result<Value, ChatError>,
        conversation_id: u64,
        what: &str,
    ) -> Result<(), ChatError> {
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!(
                    conversation_id,
                    "conversation not found in chat (404), skipping {what}"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ChatApi for ChatClient {
    async fn update_conversation(
        &self,
        conversation_id: u64,
        update: &ConversationUpdate,
    ) -> Result<(), ChatError> {
        let result = self
            .request(
                reqwest::Method::PATCH,
                &format!("conversations/{conversation_id}"),
                Some(update.to_body()),
            )
            .await;
        Self::absorb_not_found(result, conversation_id, "conversation update")
    }

    async fn toggle_conversation_status(
        &self,
        conversation_id: u64,
        status: &str,
    ) -> Result<(), ChatError> {
        self.request(
            reqwest::Method::POST,
            &format!("conversations/{conversation_id}/toggle_status"),
            Some(json!({ "status": status })),
        )
        .await
        .map(|_| ())
    }

    async fn assign_conversation_agent(
        &self,
        conversation_id: u64,
        assignee_id: u64,
    ) -> Result<(), ChatError> {
        self.request(
            reqwest::Method::POST,
            &format!("conversations/{conversation_id}/assignments"),
            Some(json!({ "assignee_id": assignee_id })),
        )
        .await
        .map(|_| ())
    }

    async fn update_conversation_custom_attributes(
        &self,
        conversation_id: u64,
        attributes: &Map<String, Value>,
    ) -> Result<(), ChatError> {
        let result = self
            .request(
                reqwest::Method::POST,
                &format!("conversations/{conversation_id}/custom_attributes"),
                Some(json!({ "custom_attributes": attributes })),
            )
            .await;
        Self::absorb_not_found(result, conversation_id, "custom attribute patch")
    }

    async fn send_message(&self, conversation_id: u64, content: &str) -> Result<(), ChatError> {
        self.request(
            reqwest::Method::POST,
            &format!("conversations/{conversation_id}/messages"),
            Some(json!({ "content": content, "message_type": "outgoing" })),
        )
        .await
        .map(|_| ())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<ChatAgent>, ChatError> {
        let needle = email.trim().to_ascii_lowercase();
        let agents = self.list_all_agents().await?;
        Ok(agents.into_iter().find(|a| {
            a.email
                .as_deref()
                .map(|e| e.trim().eq_ignore_ascii_case(&needle))
                .unwrap_or(false)
        }))
    }

    async fn find_user_by_custom_attribute(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Option<ChatAgent>, ChatError> {
        let agents = self.list_all_agents().await?;
        Ok(agents.into_iter().find(|a| {
            a.custom_attributes
                .as_ref()
                .and_then(|attrs| attrs.get(key))
                .and_then(Value::as_str)
                .map(|v| v == value)
                .unwrap_or(false)
        }))
    }

    async fn list_all_agents(&self) -> Result<Vec<ChatAgent>, ChatError> {
        let value = self
            .request(reqwest::Method::GET, "agents", None)
            .await?;
        serde_json::from_value(value).map_err(|e| ChatError::Decode(e.to_string()))
    }

    async fn create_user(&self, user: &NewChatUser) -> Result<CreateUserOutcome, ChatError> {
        let mut body = Map::new();
        body.insert("name".to_string(), user.name.clone().into());
        body.insert("email".to_string(), user.email.clone().into());
        if let Some(attrs) = &user.custom_attributes {
            body.insert("custom_attributes".to_string(), Value::Object(attrs.clone()));
        }

        let result = self
            .request(reqwest::Method::POST, "agents", Some(Value::Object(body)))
            .await;
        match result {
            Ok(value) => {
                let agent = serde_json::from_value(value)
                    .map_err(|e| ChatError::Decode(e.to_string()))?;
                Ok(CreateUserOutcome::Created(agent))
            }
            Err(e) if e.is_unprocessable() => Ok(CreateUserOutcome::AlreadyExists),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_body_distinguishes_clear_from_untouched() {
        let untouched = ConversationUpdate::status("open").to_body();
        assert_eq!(untouched, json!({ "status": "open" }));

        let cleared = ConversationUpdate::clear_assignee().to_body();
        assert_eq!(cleared, json!({ "assignee_id": null }));

        let both = ConversationUpdate {
            status: Some("pending".to_string()),
            assignee_id: Some(Some(31)),
        }
        .to_body();
        assert_eq!(both, json!({ "status": "pending", "assignee_id": 31 }));
    }

    #[test]
    fn error_classification() {
        let nf = ChatError::Status {
            status: 404,
            body: String::new(),
        };
        assert!(nf.is_not_found());
        assert!(!nf.is_unprocessable());

        let exists = ChatError::Status {
            status: 422,
            body: String::new(),
        };
        assert!(exists.is_unprocessable());
    }
}
