use clap::{Parser, ValueEnum};
use llamachat_backend::storage::DEFAULT_MAX_CONVERSATIONS;
use llamachat_backend::LlmConfig;
use std::path::PathBuf;

pub const DEFAULT_LOG_FILTER: &str = "llamachat=info,llamachat_backend=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BridgeKind {
    /// Built-in runtime that echoes prompts back
    Echo,
    /// llama.cpp HTTP server
    Http,
}

/// Local chat front-end for a llama.cpp runtime
#[derive(Debug, Clone, Parser)]
#[command(name = "llamachat", version)]
#[command(about = "Chat with a local language model from the terminal", long_about = None)]
pub struct Config {
    /// Directory holding db.sqlite (default: <platform data dir>/llamachat)
    #[arg(long, env = "LLAMACHAT_DATA_DIR", value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Runtime behind the chat
    #[arg(long, value_enum, default_value_t = BridgeKind::Echo)]
    pub bridge: BridgeKind,

    /// Base URL of the llama.cpp server (http bridge only)
    #[arg(
        long,
        env = "LLAMACHAT_SERVER_URL",
        default_value = "http://127.0.0.1:8080"
    )]
    pub server_url: String,

    #[arg(long, default_value = "bundled://model.gguf")]
    pub model_path: String,

    #[arg(long, default_value = "Default Model")]
    pub model_name: String,

    /// Oldest conversations beyond this count are evicted
    #[arg(long, default_value_t = DEFAULT_MAX_CONVERSATIONS)]
    pub max_conversations: usize,

    /// Log filter, e.g. `debug` or `llamachat=trace` (overrides RUST_LOG)
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Config {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("llamachat")
        })
    }

    /// `base` with the model taken from the flags.
    pub fn llm_config(&self, base: LlmConfig) -> LlmConfig {
        LlmConfig {
            model_path: self.model_path.clone(),
            model_name: self.model_name.clone(),
            ..base
        }
    }
}
