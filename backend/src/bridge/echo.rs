use super::{BridgeEvent, Error, Generation, InitResult, LlamaBridge, ModelInfo, EVENT_CAPACITY};
use crate::llm::LlmConfig;
use async_trait::async_trait;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Default)]
struct Script {
    reply: Option<(String, usize)>,
    failure: Option<String>,
    init_failure: Option<String>,
    status_failure: bool,
    progress: Vec<String>,
    delay: Duration,
}

/// Stand-in runtime for builds without a real engine.
///
/// By default it answers `"Mock response to: <prompt>"` and reports
/// `prompt length + 20` tokens. The builder methods script other replies,
/// failures and partial output, which is what the tests use it for.
pub struct EchoBridge {
    loaded: AtomicBool,
    script: Mutex<Script>,
    prompts: Mutex<Vec<String>>,
    events: broadcast::Sender<BridgeEvent>,
}

impl Default for EchoBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoBridge {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            loaded: AtomicBool::new(false),
            script: Mutex::new(Script::default()),
            prompts: Mutex::new(vec![]),
            events,
        }
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_reply(self, text: &str, tokens: usize) -> Self {
        self.script().reply = Some((text.to_string(), tokens));
        self
    }

    pub fn with_progress(self, chunks: &[&str]) -> Self {
        self.script().progress = chunks.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.script().delay = delay;
        self
    }

    pub fn rejecting_init(self, message: &str) -> Self {
        self.script().init_failure = Some(message.to_string());
        self
    }

    pub fn with_broken_status(self) -> Self {
        self.script().status_failure = true;
        self
    }

    /// `Some` makes every following generation fail with that message.
    pub fn set_failure(&self, failure: Option<&str>) {
        self.script().failure = failure.map(str::to_string);
    }

    pub fn failing(self, message: &str) -> Self {
        self.set_failure(Some(message));
        self
    }

    pub fn set_loaded(&self, loaded: bool) {
        self.loaded.store(loaded, Ordering::SeqCst);
    }

    /// Every prompt received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    fn emit(&self, event: BridgeEvent) {
        // No subscriber is fine.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl LlamaBridge for EchoBridge {
    async fn initialize(&self, model_path: &str) -> Result<InitResult, Error> {
        debug!("Initializing with model: {model_path}");
        if let Some(message) = self.script().init_failure.clone() {
            return Ok(InitResult {
                success: false,
                message,
            });
        }
        self.set_loaded(true);
        Ok(InitResult {
            success: true,
            message: "Model initialized successfully".to_string(),
        })
    }

    async fn generate_response(
        &self,
        prompt: &str,
        _config: &LlmConfig,
    ) -> Result<Generation, Error> {
        self.prompts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(prompt.to_string());
        let (reply, failure, progress, delay) = {
            let script = self.script();
            (
                script.reply.clone(),
                script.failure.clone(),
                script.progress.clone(),
                script.delay,
            )
        };

        let mut partial = String::new();
        for (i, chunk) in progress.iter().enumerate() {
            partial.push_str(chunk);
            self.emit(BridgeEvent::ResponseUpdate {
                text: partial.clone(),
                progress: (i + 1) as f32 / progress.len() as f32,
            });
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = failure {
            self.emit(BridgeEvent::Error {
                error: error.clone(),
                code: 1,
            });
            return Err(Error::Engine(error));
        }

        let (text, tokens) =
            reply.unwrap_or_else(|| (format!("Mock response to: {prompt}"), prompt.len() + 20));
        self.emit(BridgeEvent::ResponseComplete {
            text: text.clone(),
            tokens,
        });
        Ok(Generation {
            text,
            success: true,
            tokens,
            model: "mock-model".to_string(),
        })
    }

    async fn is_model_loaded(&self) -> Result<bool, Error> {
        if self.script().status_failure {
            return Err(Error::Engine("status unavailable".to_string()));
        }
        Ok(self.loaded.load(Ordering::SeqCst))
    }

    async fn get_model_info(&self) -> Result<ModelInfo, Error> {
        if self.script().status_failure {
            return Err(Error::Engine("status unavailable".to_string()));
        }
        Ok(ModelInfo {
            name: "Mock Model".to_string(),
            size: "0 MB".to_string(),
            kind: "mock".to_string(),
            loaded: self.loaded.load(Ordering::SeqCst),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }
}
