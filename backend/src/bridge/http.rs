use super::{BridgeEvent, Error, Generation, InitResult, LlamaBridge, ModelInfo, EVENT_CAPACITY};
use crate::llm::LlmConfig;
use ::reqwest::{header::CONTENT_TYPE, Client, Response, StatusCode};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::{broadcast, Mutex};

/// Runtime reached through a llama.cpp server (`llama-server`).
///
/// The server loads its model at startup, so `initialize` only checks that
/// the server is up and remembers which model the caller asked for.
pub struct HttpBridge {
    client: Client,
    url: String,
    model_path: Mutex<Option<String>>,
    events: broadcast::Sender<BridgeEvent>,
}

#[derive(Serialize)]
struct Payload<'a> {
    prompt: &'a str,
    n_predict: usize,
    temperature: f32,
    top_p: f32,
    top_k: usize,
    repeat_penalty: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct Chunk {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
    #[serde(default)]
    tokens_predicted: Option<usize>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Props {
    #[serde(default)]
    model_path: Option<String>,
}

/// Splits a server-sent event stream into `data:` payloads, keeping a
/// partial trailing line until the next chunk completes it.
#[derive(Default)]
struct EventBuffer {
    leftover: Vec<u8>,
}

impl EventBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.leftover.extend_from_slice(bytes);
        let mut payloads = vec![];
        while let Some(end) = self.leftover.iter().position(|&c| c == b'\n') {
            let line: Vec<u8> = self.leftover.drain(..=end).collect();
            let line = line.strip_suffix(b"\n").unwrap_or(&line);
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if let Some(data) = line.strip_prefix(b"data: ") {
                if data != b"[DONE]" {
                    payloads.push(data.to_vec());
                }
            }
        }
        payloads
    }
}

fn model_name(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(path)
        .to_string()
}

impl HttpBridge {
    pub fn new(url: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            client: Client::new(),
            url: url.trim_end_matches('/').to_string(),
            model_path: Mutex::new(None),
            events,
        }
    }

    async fn health(&self) -> Result<StatusCode, Error> {
        let res = self.client.get(format!("{}/health", self.url)).send().await?;
        Ok(res.status())
    }

    fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }

    async fn stream(&self, mut res: Response, n_predict: usize) -> Result<Generation, Error> {
        let mut buffer = EventBuffer::default();
        let mut text = String::new();
        let mut tokens = 0;
        let mut model = None;
        while let Some(bytes) = res.chunk().await? {
            for payload in buffer.push(&bytes) {
                let chunk: Chunk = serde_json::from_slice(&payload)?;
                text.push_str(&chunk.content);
                if chunk.stop {
                    tokens = chunk.tokens_predicted.unwrap_or(tokens);
                    model = chunk.model.or(model);
                } else {
                    tokens += 1;
                    let progress = if n_predict > 0 {
                        (tokens as f32 / n_predict as f32).min(1.0)
                    } else {
                        0.0
                    };
                    self.emit(BridgeEvent::ResponseUpdate {
                        text: text.clone(),
                        progress,
                    });
                }
            }
        }
        let model = match model {
            Some(model) => model,
            None => self
                .model_path
                .lock()
                .await
                .as_deref()
                .map(model_name)
                .unwrap_or_else(|| "llama.cpp".to_string()),
        };
        Ok(Generation {
            text,
            success: true,
            tokens,
            model,
        })
    }
}

#[async_trait]
impl LlamaBridge for HttpBridge {
    async fn initialize(&self, model_path: &str) -> Result<InitResult, Error> {
        info!("Connecting to {} for {model_path}", self.url);
        let status = self.health().await?;
        if status.is_success() {
            *self.model_path.lock().await = Some(model_path.to_string());
            Ok(InitResult {
                success: true,
                message: format!("Model served by {}", self.url),
            })
        } else if status == StatusCode::SERVICE_UNAVAILABLE {
            Ok(InitResult {
                success: false,
                message: "Model is still loading".to_string(),
            })
        } else {
            Ok(InitResult {
                success: false,
                message: format!("Server answered {status}"),
            })
        }
    }

    async fn generate_response(
        &self,
        prompt: &str,
        config: &LlmConfig,
    ) -> Result<Generation, Error> {
        let payload = Payload {
            prompt,
            n_predict: config.max_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            repeat_penalty: config.repeat_penalty,
            stream: true,
        };
        debug!("Sending prompt of {} bytes", prompt.len());
        let res = self
            .client
            .post(format!("{}/completion", self.url))
            .header(CONTENT_TYPE, "application/json")
            .json(&payload)
            .send()
            .await
            .and_then(|res| res.error_for_status());
        let result = match res {
            Ok(res) => self.stream(res, config.max_tokens).await,
            Err(err) => Err(err.into()),
        };
        match &result {
            Ok(generation) => self.emit(BridgeEvent::ResponseComplete {
                text: generation.text.clone(),
                tokens: generation.tokens,
            }),
            Err(err) => {
                warn!("Generation failed {err}");
                let code = match err {
                    Error::ReqwestError(err) => err.status().map(|s| s.as_u16() as i32),
                    _ => None,
                };
                self.emit(BridgeEvent::Error {
                    error: err.to_string(),
                    code: code.unwrap_or(-1),
                });
            }
        }
        result
    }

    async fn is_model_loaded(&self) -> Result<bool, Error> {
        Ok(self.health().await?.is_success())
    }

    async fn get_model_info(&self) -> Result<ModelInfo, Error> {
        let res = self.client.get(format!("{}/props", self.url)).send().await?;
        let props: Props = res.error_for_status()?.json().await?;
        let path = match props.model_path {
            Some(path) => Some(path),
            None => self.model_path.lock().await.clone(),
        };
        let Some(path) = path else {
            return Ok(ModelInfo::unknown());
        };
        let size = tokio::fs::metadata(&path)
            .await
            .map(|meta| meta.len() / 1_000_000)
            .unwrap_or(0);
        let kind = match Path::new(&path).extension().and_then(|ext| ext.to_str()) {
            Some("gguf") => "gguf",
            Some("ggml" | "bin") => "ggml",
            _ => "llama.cpp",
        };
        Ok(ModelInfo {
            name: model_name(&path),
            size: format!("{size} MB"),
            kind: kind.to_string(),
            loaded: self.is_model_loaded().await?,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }
}
