//! Contract of the inference runtime the chat talks to.
//!
//! The runtime itself (model loading, tokenization, sampling) lives outside
//! this crate. [`LlamaBridge`] is the request/response surface it exposes,
//! plus a broadcast stream of [`BridgeEvent`]s for partial output.

mod echo;
mod http;

pub use echo::EchoBridge;
pub use http::HttpBridge;

use crate::llm::LlmConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the event channel every bridge exposes.
pub const EVENT_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Reqwest error {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("deserialization error {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("Engine error {0}")]
    Engine(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitResult {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub success: bool,
    pub tokens: usize,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    /// Human readable, e.g. `"3900 MB"`.
    pub size: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub loaded: bool,
}

impl ModelInfo {
    pub fn unknown() -> Self {
        ModelInfo {
            name: "Unknown".to_string(),
            size: "0 MB".to_string(),
            kind: "unknown".to_string(),
            loaded: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// Text generated so far.
    ResponseUpdate { text: String, progress: f32 },
    ResponseComplete { text: String, tokens: usize },
    Error { error: String, code: i32 },
}

#[async_trait]
pub trait LlamaBridge: Send + Sync {
    async fn initialize(&self, model_path: &str) -> Result<InitResult, Error>;

    async fn generate_response(&self, prompt: &str, config: &LlmConfig)
        -> Result<Generation, Error>;

    async fn is_model_loaded(&self) -> Result<bool, Error>;

    async fn get_model_info(&self) -> Result<ModelInfo, Error>;

    /// Events emitted while generating. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<BridgeEvent>;
}
