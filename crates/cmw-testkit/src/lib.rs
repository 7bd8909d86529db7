//! In-process fakes shared by scenario tests.
//!
//! [`RecordingChat`] implements the chat API against memory: every call is
//! recorded, canned agents back the lookup endpoints, and duplicate e-mails
//! reproduce the platform's 422-on-create semantics.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};

use cmw_chat::{
    ChatAgent, ChatApi, ChatError, ConversationUpdate, CreateUserOutcome, NewChatUser,
};

/// One recorded chat API call.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatCall {
    UpdateConversation {
        conversation_id: u64,
        status: Option<String>,
        assignee_id: Option<Option<u64>>,
    },
    ToggleStatus {
        conversation_id: u64,
        status: String,
    },
    AssignAgent {
        conversation_id: u64,
        assignee_id: u64,
    },
    CustomAttributes {
        conversation_id: u64,
        keys: Vec<String>,
    },
    Message {
        conversation_id: u64,
        content: String,
    },
    CreateUser {
        email: String,
    },
}

#[derive(Default)]
pub struct RecordingChat {
    calls: Mutex<Vec<ChatCall>>,
    agents: Mutex<Vec<ChatAgent>>,
    /// When set, every conversation-facing call fails with this HTTP status.
    pub fail_with_status: Mutex<Option<u16>>,
}

impl RecordingChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agents(agents: Vec<ChatAgent>) -> Self {
        RecordingChat {
            agents: Mutex::new(agents),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<ChatCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn messages_sent(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ChatCall::Message { content, .. } => Some(content),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: ChatCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn maybe_fail(&self) -> Result<(), ChatError> {
        if let Some(status) = *self.fail_with_status.lock().unwrap() {
            return Err(ChatError::Status {
                status,
                body: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn next_agent_id(&self) -> u64 {
        self.agents
            .lock()
            .unwrap()
            .iter()
            .filter_map(|a| a.id)
            .max()
            .unwrap_or(0)
            + 1
    }
}

#[async_trait]
impl ChatApi for RecordingChat {
    async fn update_conversation(
        &self,
        conversation_id: u64,
        update: &ConversationUpdate,
    ) -> Result<(), ChatError> {
        self.maybe_fail()?;
        self.record(ChatCall::UpdateConversation {
            conversation_id,
            status: update.status.clone(),
            assignee_id: update.assignee_id,
        });
        Ok(())
    }

    async fn toggle_conversation_status(
        &self,
        conversation_id: u64,
        status: &str,
    ) -> Result<(), ChatError> {
        self.maybe_fail()?;
        self.record(ChatCall::ToggleStatus {
            conversation_id,
            status: status.to_string(),
        });
        Ok(())
    }

    async fn assign_conversation_agent(
        &self,
        conversation_id: u64,
        assignee_id: u64,
    ) -> Result<(), ChatError> {
        self.maybe_fail()?;
        self.record(ChatCall::AssignAgent {
            conversation_id,
            assignee_id,
        });
        Ok(())
    }

    async fn update_conversation_custom_attributes(
        &self,
        conversation_id: u64,
        attributes: &Map<String, Value>,
    ) -> Result<(), ChatError> {
        self.maybe_fail()?;
        let mut keys: Vec<String> = attributes.keys().cloned().collect();
        keys.sort();
        self.record(ChatCall::CustomAttributes {
            conversation_id,
            keys,
        });
        Ok(())
    }

    async fn send_message(&self, conversation_id: u64, content: &str) -> Result<(), ChatError> {
        self.maybe_fail()?;
        self.record(ChatCall::Message {
            conversation_id,
            content: content.to_string(),
        });
        Ok(())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<ChatAgent>, ChatError> {
        let needle = email.trim().to_ascii_lowercase();
        Ok(self
            .agents
            .lock()
            .unwrap()
            .iter()
            .find(|a| {
                a.email
                    .as_deref()
                    .map(|e| e.trim().eq_ignore_ascii_case(&needle))
                    .unwrap_or(false)
            })
            .cloned())
    }

    async fn find_user_by_custom_attribute(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Option<ChatAgent>, ChatError> {
        Ok(self
            .agents
            .lock()
            .unwrap()
            .iter()
            .find(|a| {
                a.custom_attributes
                    .as_ref()
                    .and_then(|attrs| attrs.get(key))
                    .and_then(Value::as_str)
                    .map(|v| v == value)
                    .unwrap_or(false)
            })
            .cloned())
    }

    async fn list_all_agents(&self) -> Result<Vec<ChatAgent>, ChatError> {
        Ok(self.agents.lock().unwrap().clone())
    }

    async fn create_user(&self, user: &NewChatUser) -> Result<CreateUserOutcome, ChatError> {
        self.record(ChatCall::CreateUser {
            email: user.email.clone(),
        });
        if self.find_user_by_email(&user.email).await?.is_some() {
            return Ok(CreateUserOutcome::AlreadyExists);
        }
        let agent = ChatAgent {
            id: Some(self.next_agent_id()),
            name: Some(user.name.clone()),
            email: Some(user.email.clone()),
            custom_attributes: user.custom_attributes.clone(),
        };
        self.agents.lock().unwrap().push(agent.clone());
        Ok(CreateUserOutcome::Created(agent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_calls_in_order() {
        let chat = RecordingChat::new();
        chat.toggle_conversation_status(7, "resolved").await.unwrap();
        chat.send_message(7, "done").await.unwrap();

        let calls = chat.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0],
            ChatCall::ToggleStatus {
                conversation_id: 7,
                status: "resolved".to_string()
            }
        );
        assert_eq!(chat.messages_sent(), vec!["done".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_email_reports_already_exists() {
        let chat = RecordingChat::new();
        let user = NewChatUser {
            name: "A".to_string(),
            email: "a@x.io".to_string(),
            custom_attributes: None,
        };
        assert!(matches!(
            chat.create_user(&user).await.unwrap(),
            CreateUserOutcome::Created(_)
        ));
        assert!(matches!(
            chat.create_user(&user).await.unwrap(),
            CreateUserOutcome::AlreadyExists
        ));
    }

    #[tokio::test]
    async fn injected_failure_propagates() {
        let chat = RecordingChat::new();
        *chat.fail_with_status.lock().unwrap() = Some(503);
        let err = chat.send_message(1, "x").await.unwrap_err();
        assert!(matches!(err, ChatError::Status { status: 503, .. }));
        assert!(chat.calls().is_empty());
    }
}
