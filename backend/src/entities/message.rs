use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Label used when flattening a history into a prompt.
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "Human",
            Role::Assistant => "Assistant",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub text: String,
    /// Mirrors `text`, kept for the prompt builder and older exports.
    pub content: String,
    pub is_user: bool,
    pub role: Role,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<usize>,
}

impl Message {
    pub fn user(conversation_id: &str, text: &str) -> Self {
        Self::new(conversation_id, text, Role::User, None)
    }

    pub fn assistant(conversation_id: &str, text: &str, tokens: Option<usize>) -> Self {
        Self::new(conversation_id, text, Role::Assistant, tokens)
    }

    fn new(conversation_id: &str, text: &str, role: Role, tokens: Option<usize>) -> Self {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.to_owned(),
            content: text.to_owned(),
            is_user: role == Role::User,
            role,
            timestamp: super::now(),
            conversation_id: conversation_id.to_owned(),
            tokens,
        }
    }
}
