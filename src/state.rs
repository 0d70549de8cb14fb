use llamachat_backend::{AppSettings, Conversation, LlmConfig, Message, PerformanceMetrics};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatState {
    pub conversations: Vec<Conversation>,
    pub current_conversation_id: Option<String>,
    /// Messages of the current conversation, oldest first.
    pub messages: Vec<Message>,
    pub is_loading: bool,
    pub is_typing: bool,
    pub error: Option<String>,
    /// Metrics of the latest successful reply.
    pub last_performance: Option<PerformanceMetrics>,
}

impl ChatState {
    pub fn current_conversation(&self) -> Option<&Conversation> {
        let id = self.current_conversation_id.as_deref()?;
        self.conversations.iter().find(|c| c.id == id)
    }
}

/// Part of [`ChatState`] restored on the next start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedChat {
    pub current_conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    /// Leading number of the size the runtime reports.
    pub size: u64,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub tokens_per_second: f64,
    pub average_latency: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmState {
    pub is_model_loaded: bool,
    pub model_info: Option<ModelInfo>,
    pub config: LlmConfig,
    pub performance: Option<PerformanceSummary>,
    pub is_initializing: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedModel {
    pub config: LlmConfig,
    pub model_info: Option<ModelInfo>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn from_dark_mode(dark_mode: bool) -> Self {
        if dark_mode {
            Theme::Dark
        } else {
            Theme::Light
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    pub theme: Theme,
    pub settings: AppSettings,
    pub is_first_launch: bool,
}

impl Default for AppState {
    fn default() -> Self {
        AppState {
            theme: Theme::Light,
            settings: AppSettings::default(),
            is_first_launch: true,
        }
    }
}

/// Theme and settings are restored from the settings document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedApp {
    pub is_first_launch: bool,
}
