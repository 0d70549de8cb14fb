use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TITLE: &str = "New Chat";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub last_message: String,
    /// Most recent activity, drives list ordering.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub message_count: usize,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new() -> Self {
        let now = super::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: DEFAULT_TITLE.to_owned(),
            last_message: String::new(),
            timestamp: now,
            message_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}
