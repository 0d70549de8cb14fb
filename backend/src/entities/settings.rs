use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub selected_model: String,
    pub show_performance_metrics: bool,
    pub auto_title: bool,
    pub dark_mode: bool,
    pub auto_save: bool,
    pub max_conversations: usize,
    pub enable_notifications: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        AppSettings {
            selected_model: "default".to_string(),
            show_performance_metrics: false,
            auto_title: true,
            dark_mode: false,
            auto_save: true,
            max_conversations: 100,
            enable_notifications: true,
        }
    }
}
