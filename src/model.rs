use crate::state::{LlmState, ModelInfo, PerformanceSummary, PersistedModel};
use llamachat_backend::storage::{Storage, StoreSlice};
use llamachat_backend::{LlmConfig, LlmService, PerformanceMetrics};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::watch;

pub const INIT_FAILED: &str = "Failed to initialize model";

/// Leading decimal digits of a size such as `"4 GB"`, 0 when there are none.
fn parse_size(size: &str) -> u64 {
    let digits: String = size
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().unwrap_or(0)
}

/// Model load status, configuration and the latest performance numbers.
///
/// The configuration and the last model info are persisted and come back
/// through [`ModelStore::restore`].
#[derive(Clone)]
pub struct ModelStore {
    state: Arc<watch::Sender<LlmState>>,
    llm: Arc<LlmService>,
    storage: Arc<Storage>,
}

impl ModelStore {
    pub fn new(llm: Arc<LlmService>, storage: Arc<Storage>) -> Self {
        let (state, _) = watch::channel(LlmState::default());
        Self {
            state: Arc::new(state),
            llm,
            storage,
        }
    }

    async fn persist(&self) {
        let persisted = {
            let state = self.state.borrow();
            PersistedModel {
                config: state.config.clone(),
                model_info: state.model_info.clone(),
            }
        };
        if let Err(err) = self.storage.save_slice(StoreSlice::Model, &persisted).await {
            warn!("Error saving model state: {err}");
        }
    }

    pub async fn restore(&self) {
        let Some(persisted) = self
            .storage
            .load_slice::<PersistedModel>(StoreSlice::Model)
            .await
        else {
            return;
        };
        debug!("Restoring model config for {}", persisted.config.model_name);
        self.state.send_modify(|state| {
            state.config = persisted.config;
            state.model_info = persisted.model_info;
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<LlmState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> LlmState {
        self.state.borrow().clone()
    }

    pub async fn initialize_model(&self, config: LlmConfig) -> bool {
        self.state.send_modify(|state| {
            state.is_initializing = true;
            state.error = None;
        });

        if self.llm.initialize_model(&config.model_path, &config).await {
            let info = self.llm.get_model_info().await;
            info!("Model ready: {} ({})", info.name, info.size);
            let model_info = ModelInfo {
                name: info.name,
                size: parse_size(&info.size),
                path: config.model_path.clone(),
            };
            self.state.send_modify(|state| {
                state.is_model_loaded = true;
                state.model_info = Some(model_info);
                state.config = config;
                state.is_initializing = false;
            });
            self.persist().await;
            true
        } else {
            self.state.send_modify(|state| {
                state.is_model_loaded = false;
                state.is_initializing = false;
                state.error = Some(INIT_FAILED.to_string());
            });
            false
        }
    }

    pub async fn check_model_status(&self) -> bool {
        let loaded = self.llm.is_model_loaded().await;
        self.state.send_if_modified(|state| {
            let changed = state.is_model_loaded != loaded;
            state.is_model_loaded = loaded;
            changed
        });
        loaded
    }

    pub async fn cleanup(&self) {
        self.llm.cleanup().await;
        self.state.send_modify(|state| {
            state.is_model_loaded = false;
            state.model_info = None;
            state.performance = None;
            state.error = None;
        });
        self.persist().await;
    }

    pub async fn update_config(&self, f: impl FnOnce(&mut LlmConfig)) {
        self.state.send_modify(|state| f(&mut state.config));
        self.persist().await;
    }

    pub fn update_performance(&self, metrics: &PerformanceMetrics) {
        let summary = PerformanceSummary {
            tokens_per_second: metrics.tokens_per_second,
            average_latency: metrics.response_time,
        };
        self.state
            .send_modify(|state| state.performance = Some(summary));
    }

    pub fn set_error(&self, error: Option<String>) {
        if let Some(error) = &error {
            warn!("Model error: {error}");
        }
        self.state.send_modify(|state| state.error = error);
    }
}
