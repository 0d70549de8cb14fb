use crate::bridge::{BridgeEvent, LlamaBridge, ModelInfo};
use crate::entities::Message;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

/// Characters per token used to estimate prompt usage. There is no tokenizer
/// on this side of the bridge, so prompt token counts are approximate.
pub const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    pub model_path: String,
    pub model_name: String,
    pub context_size: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: usize,
    pub repeat_penalty: f32,
    pub max_tokens: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            model_path: "bundled://model.gguf".to_string(),
            model_name: "Default Model".to_string(),
            context_size: 2048,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
            max_tokens: 512,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub tokens_per_second: f64,
    /// Milliseconds.
    pub response_time: u64,
    // Reserved until a runtime reports them.
    pub memory_usage: u64,
    pub cpu_usage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmResponse {
    pub text: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub model: String,
    pub usage: Usage,
    pub performance: PerformanceMetrics,
}

/// Flattens a history into `Human: ...` / `Assistant: ...` turns separated by
/// a blank line, ending with an open assistant turn.
pub fn messages_to_prompt(messages: &[Message]) -> String {
    let mut prompt = messages
        .iter()
        .map(|message| format!("{}: {}", message.role.label(), message.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    prompt.push_str("\n\nAssistant:");
    prompt
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

fn forward(event: BridgeEvent, on_progress: &mut Option<&mut (dyn FnMut(&str) + Send)>) {
    if let (BridgeEvent::ResponseUpdate { text, .. }, Some(on_progress)) = (event, on_progress) {
        on_progress(&text);
    }
}

/// Inference gateway: prompt building, usage accounting and the lifecycle of
/// one bridge. Generation failures are returned as unsuccessful
/// [`LlmResponse`]s, never as errors.
pub struct LlmService {
    bridge: Arc<dyn LlamaBridge>,
    model_loaded: AtomicBool,
    current_config: Mutex<Option<LlmConfig>>,
}

impl LlmService {
    pub fn new(bridge: Arc<dyn LlamaBridge>) -> Self {
        Self {
            bridge,
            model_loaded: AtomicBool::new(false),
            current_config: Mutex::new(None),
        }
    }

    pub async fn initialize_model(&self, model_path: &str, config: &LlmConfig) -> bool {
        info!("Initializing LLM model: {model_path}");
        match self.bridge.initialize(model_path).await {
            Ok(result) if result.success => {
                self.model_loaded.store(true, Ordering::SeqCst);
                *self.current_config.lock().await = Some(config.clone());
                info!("Model initialized successfully: {}", result.message);
                true
            }
            Ok(result) => {
                error!("Failed to initialize model: {}", result.message);
                false
            }
            Err(err) => {
                error!("Error initializing model: {err}");
                false
            }
        }
    }

    /// Generates a reply to `messages`.
    ///
    /// `config` overrides the configuration given at initialization for this
    /// call only. `on_progress` receives the partial text while the bridge
    /// streams; it is unsubscribed once the call settles.
    pub async fn generate_response(
        &self,
        messages: &[Message],
        config: Option<&LlmConfig>,
        mut on_progress: Option<&mut (dyn FnMut(&str) + Send)>,
    ) -> LlmResponse {
        let start = Instant::now();
        let current = self.current_config.lock().await.clone();
        let fallback_model = current
            .as_ref()
            .map(|c| c.model_name.clone())
            .unwrap_or_else(|| "unknown".to_string());

        if !self.model_loaded.load(Ordering::SeqCst) {
            return Self::failure(
                "Model not loaded. Please initialize first.".to_string(),
                fallback_model,
                start,
            );
        }
        let config = config.cloned().or(current).unwrap_or_default();
        let prompt = messages_to_prompt(messages);

        let mut events = on_progress.is_some().then(|| self.bridge.subscribe());
        let generation = self.bridge.generate_response(&prompt, &config);
        tokio::pin!(generation);
        let result = loop {
            let Some(rx) = events.as_mut() else {
                break generation.await;
            };
            tokio::select! {
                result = &mut generation => break result,
                event = rx.recv() => match event {
                    Ok(event) => forward(event, &mut on_progress),
                    Err(RecvError::Lagged(skipped)) => warn!("Skipped {skipped} progress events"),
                    Err(RecvError::Closed) => events = None,
                },
            }
        };
        if let Some(mut rx) = events.take() {
            loop {
                match rx.try_recv() {
                    Ok(event) => forward(event, &mut on_progress),
                    Err(TryRecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
        }

        let generation = match result {
            Ok(generation) if generation.success => generation,
            Ok(_) => {
                return Self::failure(
                    "Runtime reported an unsuccessful generation".to_string(),
                    fallback_model,
                    start,
                )
            }
            Err(err) => {
                error!("Error generating response: {err}");
                return Self::failure(err.to_string(), fallback_model, start);
            }
        };

        let elapsed = start.elapsed();
        let seconds = elapsed.as_secs_f64();
        let tokens_per_second = if generation.tokens > 0 && seconds > 0.0 {
            generation.tokens as f64 / seconds
        } else {
            0.0
        };
        let prompt_tokens = estimate_tokens(&prompt);
        LlmResponse {
            text: generation.text,
            success: true,
            error: None,
            model: generation.model,
            usage: Usage {
                prompt_tokens,
                completion_tokens: generation.tokens,
                total_tokens: prompt_tokens + generation.tokens,
            },
            performance: PerformanceMetrics {
                tokens_per_second,
                response_time: elapsed.as_millis() as u64,
                memory_usage: 0,
                cpu_usage: 0.0,
            },
        }
    }

    fn failure(error: String, model: String, start: Instant) -> LlmResponse {
        LlmResponse {
            text: String::new(),
            success: false,
            error: Some(error),
            model,
            usage: Usage::default(),
            performance: PerformanceMetrics {
                response_time: start.elapsed().as_millis() as u64,
                ..Default::default()
            },
        }
    }

    /// Asks the bridge and refreshes the local ready flag.
    pub async fn is_model_loaded(&self) -> bool {
        match self.bridge.is_model_loaded().await {
            Ok(loaded) => {
                self.model_loaded.store(loaded, Ordering::SeqCst);
                loaded
            }
            Err(err) => {
                error!("Error checking model status: {err}");
                false
            }
        }
    }

    pub async fn get_model_info(&self) -> ModelInfo {
        self.bridge.get_model_info().await.unwrap_or_else(|err| {
            error!("Error getting model info: {err}");
            ModelInfo::unknown()
        })
    }

    pub async fn current_config(&self) -> Option<LlmConfig> {
        self.current_config.lock().await.clone()
    }

    pub async fn cleanup(&self) {
        self.model_loaded.store(false, Ordering::SeqCst);
        *self.current_config.lock().await = None;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.bridge.subscribe()
    }
}
