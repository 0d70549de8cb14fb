use crate::chat::ConversationStore;
use crate::config::{BridgeKind, Config};
use crate::model::ModelStore;
use crate::settings::SettingsStore;
use crate::state::Theme;
use llamachat_backend::bridge::{EchoBridge, HttpBridge};
use llamachat_backend::kv::{KeyValueStore, SqliteStore};
use llamachat_backend::storage::{self, Storage};
use llamachat_backend::{DbErr, LlamaBridge, LlmService};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error {0}")]
    DbError(#[from] DbErr),

    #[error("IO error {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] storage::Error),
}

const HELP: &str = "\
Commands:
  /new                  start a new conversation
  /list                 list conversations
  /open <n|id>          open a conversation
  /delete <n|id>        delete a conversation
  /search <text>        search every message
  /export <file>        write all conversations to a JSON file
  /import <file>        load conversations from a JSON file
  /stats                storage statistics
  /status               model status
  /theme light|dark     switch theme
  /autotitle on|off     name conversations after the first message
  /reset                delete all data
  /quit                 exit
Anything else is sent as a message.";

const WELCOME: &str = "Welcome to llamachat. Conversations are kept on this machine only.\n";

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Send(String),
    New,
    List,
    Open(String),
    Delete(String),
    Search(String),
    Export(PathBuf),
    Import(PathBuf),
    Stats,
    Status,
    Theme(Theme),
    AutoTitle(bool),
    Reset,
    Help,
    Quit,
    Invalid(String),
}

impl Command {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Send(line.to_string());
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        match (name, arg) {
            ("new", "") => Command::New,
            ("list", "") => Command::List,
            ("open", id) if !id.is_empty() => Command::Open(id.to_string()),
            ("delete", id) if !id.is_empty() => Command::Delete(id.to_string()),
            ("search", query) if !query.is_empty() => Command::Search(query.to_string()),
            ("export", path) if !path.is_empty() => Command::Export(PathBuf::from(path)),
            ("import", path) if !path.is_empty() => Command::Import(PathBuf::from(path)),
            ("stats", "") => Command::Stats,
            ("status", "") => Command::Status,
            ("theme", "light") => Command::Theme(Theme::Light),
            ("theme", "dark") => Command::Theme(Theme::Dark),
            ("autotitle", "on") => Command::AutoTitle(true),
            ("autotitle", "off") => Command::AutoTitle(false),
            ("reset", "") => Command::Reset,
            ("help", "") => Command::Help,
            ("quit", "") | ("exit", "") => Command::Quit,
            _ => Command::Invalid(line.to_string()),
        }
    }
}

pub struct AppBuilder {
    config: Config,
}

impl AppBuilder {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Opens the database under the configured data dir and wires the stores.
    pub async fn build(self) -> Result<App, Error> {
        let dir = self.config.data_dir();
        info!("Using data dir {}", dir.display());
        let db = llamachat_backend::init_db(&dir).await?;
        let store = Arc::new(SqliteStore::new(db));
        Ok(self.build_with_store(store).await)
    }

    pub async fn build_with_store(self, store: Arc<dyn KeyValueStore>) -> App {
        let config = self.config;
        let storage =
            Arc::new(Storage::new(store).with_max_conversations(config.max_conversations));
        debug!("Keeping at most {} conversations", storage.max_conversations());
        let bridge: Arc<dyn LlamaBridge> = match config.bridge {
            BridgeKind::Echo => Arc::new(EchoBridge::new()),
            BridgeKind::Http => Arc::new(HttpBridge::new(&config.server_url)),
        };
        let llm = Arc::new(LlmService::new(bridge));

        let chat = ConversationStore::new(storage.clone(), llm.clone());
        let model = ModelStore::new(llm, storage.clone());
        let settings = SettingsStore::new(storage.clone());

        settings.load_settings().await;
        chat.set_auto_title(settings.snapshot().settings.auto_title);
        chat.load_conversations().await;
        chat.restore_active_conversation().await;
        model.restore().await;

        // Sampling parameters survive restarts, the model itself follows the flags.
        let llm_config = config.llm_config(model.snapshot().config);
        if !model.initialize_model(llm_config).await {
            warn!("Model is not ready, messages will fail until it is");
        }
        tokio::spawn(forward_performance(chat.clone(), model.clone()));

        App {
            storage,
            chat,
            model,
            settings,
        }
    }

    pub async fn run(self) -> Result<(), Error> {
        let app = self.build().await?;
        let input = BufReader::new(tokio::io::stdin());
        let output = tokio::io::stdout();
        app.repl(input, output).await?;
        app.shutdown().await;
        Ok(())
    }
}

/// Feeds the metrics of every new reply into the model store.
async fn forward_performance(chat: ConversationStore, model: ModelStore) {
    let mut rx = chat.subscribe();
    let mut last = rx.borrow_and_update().last_performance;
    while rx.changed().await.is_ok() {
        let current = rx.borrow_and_update().last_performance;
        if current != last {
            if let Some(metrics) = &current {
                model.update_performance(metrics);
            }
            last = current;
        }
    }
    debug!("Chat state closed, stopped forwarding performance");
}

pub struct App {
    storage: Arc<Storage>,
    chat: ConversationStore,
    model: ModelStore,
    settings: SettingsStore,
}

impl App {
    pub fn chat(&self) -> &ConversationStore {
        &self.chat
    }

    pub fn model(&self) -> &ModelStore {
        &self.model
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    /// Waits for pending writes and releases the model.
    pub async fn shutdown(&self) {
        self.chat.flush().await;
        self.model.cleanup().await;
        info!("Shut down");
    }

    /// Resolves a 1-based index from `/list` or a conversation id.
    fn resolve(&self, key: &str) -> Option<String> {
        let state = self.chat.snapshot();
        if let Ok(index) = key.parse::<usize>() {
            if let Some(conversation) = index.checked_sub(1).and_then(|i| state.conversations.get(i)) {
                return Some(conversation.id.clone());
            }
        }
        state
            .conversations
            .iter()
            .find(|c| c.id == key || c.id.starts_with(key))
            .map(|c| c.id.clone())
    }

    pub async fn repl<R, W>(&self, input: R, mut output: W) -> Result<(), Error>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        if self.settings.snapshot().is_first_launch {
            output.write_all(WELCOME.as_bytes()).await?;
            self.settings.set_first_launch(false).await;
        }
        output.write_all(b"Type /help for commands.\n").await?;
        output.flush().await?;
        while let Some(line) = lines.next_line().await? {
            let command = Command::parse(&line);
            if command == Command::Quit {
                break;
            }
            let text = self.execute(command).await;
            if !text.is_empty() {
                output.write_all(text.as_bytes()).await?;
                output.write_all(b"\n").await?;
            }
            output.flush().await?;
        }
        Ok(())
    }

    async fn execute(&self, command: Command) -> String {
        match command {
            Command::Send(text) => {
                if text.is_empty() {
                    return String::new();
                }
                self.chat.send_message(&text).await;
                let state = self.chat.snapshot();
                let mut out = state
                    .messages
                    .last()
                    .filter(|m| !m.is_user)
                    .map(|m| format!("{}: {}", m.role.label(), m.text))
                    .unwrap_or_default();
                if let Some(error) = &state.error {
                    out.push_str(&format!("\n[{error}]"));
                }
                if let (Some(metrics), true) = (
                    state.last_performance,
                    self.settings.snapshot().settings.show_performance_metrics,
                ) {
                    out.push_str(&format!(
                        "\n({:.1} tokens/s, {} ms)",
                        metrics.tokens_per_second, metrics.response_time
                    ));
                }
                out
            }
            Command::New => {
                let id = self.chat.create_new_conversation();
                format!("Started conversation {id}")
            }
            Command::List => {
                let state = self.chat.snapshot();
                if state.conversations.is_empty() {
                    return "No conversations yet".to_string();
                }
                state
                    .conversations
                    .iter()
                    .enumerate()
                    .map(|(i, c)| {
                        let marker = if state.current_conversation_id.as_deref() == Some(c.id.as_str()) {
                            '*'
                        } else {
                            ' '
                        };
                        format!(
                            "{marker}{:>3}. {} ({} messages, {}) {}",
                            i + 1,
                            c.title,
                            c.message_count,
                            c.timestamp.format("%Y-%m-%d %H:%M"),
                            c.id
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            Command::Open(key) => {
                let Some(id) = self.resolve(&key) else {
                    return format!("No conversation {key}");
                };
                self.chat.select_conversation(&id).await;
                let state = self.chat.snapshot();
                let mut lines: Vec<String> = state
                    .messages
                    .iter()
                    .map(|m| format!("{}: {}", m.role.label(), m.text))
                    .collect();
                if let Some(error) = state.error {
                    lines.push(format!("[{error}]"));
                }
                lines.join("\n")
            }
            Command::Delete(key) => {
                let Some(id) = self.resolve(&key) else {
                    return format!("No conversation {key}");
                };
                match self.chat.delete_conversation(&id).await {
                    Ok(()) => format!("Deleted {id}"),
                    Err(err) => format!("Could not delete {id}: {err}"),
                }
            }
            Command::Search(query) => {
                let found = self.chat.search_messages(&query).await;
                if found.is_empty() {
                    return format!("Nothing matches \"{query}\"");
                }
                found
                    .iter()
                    .map(|m| {
                        format!(
                            "[{}] {}: {}",
                            m.timestamp.format("%Y-%m-%d %H:%M"),
                            m.role.label(),
                            m.text
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            Command::Export(path) => {
                self.chat.flush().await;
                let result = match self.storage.export_data().await {
                    Ok(json) => tokio::fs::write(&path, json).await.map_err(Error::from),
                    Err(err) => Err(err.into()),
                };
                match result {
                    Ok(()) => format!("Exported to {}", path.display()),
                    Err(err) => format!("Export failed: {err}"),
                }
            }
            Command::Import(path) => {
                let result = match tokio::fs::read_to_string(&path).await {
                    Ok(json) => {
                        self.chat.flush().await;
                        self.storage.import_data(&json).await.map_err(Error::from)
                    }
                    Err(err) => Err(err.into()),
                };
                match result {
                    Ok(()) => {
                        self.chat.load_conversations().await;
                        format!(
                            "Imported {} conversations",
                            self.chat.snapshot().conversations.len()
                        )
                    }
                    Err(err) => format!("Import failed: {err}"),
                }
            }
            Command::Stats => {
                self.chat.flush().await;
                match self.storage.get_storage_stats().await {
                    Ok(stats) => format!(
                        "{} conversations, {} messages, ~{} bytes",
                        stats.total_conversations, stats.total_messages, stats.estimated_size
                    ),
                    Err(err) => format!("Could not compute stats: {err}"),
                }
            }
            Command::Status => {
                self.model.check_model_status().await;
                let state = self.model.snapshot();
                let mut out = match &state.model_info {
                    Some(info) if state.is_model_loaded => {
                        format!("Model {} loaded from {}", info.name, info.path)
                    }
                    _ => "Model not loaded".to_string(),
                };
                if let Some(performance) = state.performance {
                    out.push_str(&format!(
                        "\nLast reply: {:.1} tokens/s, {} ms",
                        performance.tokens_per_second, performance.average_latency
                    ));
                }
                if let Some(error) = state.error {
                    out.push_str(&format!("\n[{error}]"));
                }
                out
            }
            Command::Theme(theme) => {
                self.settings.set_theme(theme).await;
                format!("Theme set to {theme:?}")
            }
            Command::AutoTitle(enabled) => {
                self.settings
                    .update_settings(|settings| settings.auto_title = enabled)
                    .await;
                self.chat.set_auto_title(enabled);
                format!("Auto title {}", if enabled { "on" } else { "off" })
            }
            Command::Reset => {
                self.chat.flush().await;
                match self.settings.reset_app().await {
                    Ok(()) => {
                        self.chat.load_conversations().await;
                        self.chat
                            .set_auto_title(self.settings.snapshot().settings.auto_title);
                        "All data deleted".to_string()
                    }
                    Err(err) => format!("Reset failed: {err}"),
                }
            }
            Command::Help => HELP.to_string(),
            Command::Quit => String::new(),
            Command::Invalid(line) => format!("Unknown command {line}, try /help"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use llamachat_backend::kv::MemoryStore;

    async fn app() -> App {
        app_on(Arc::new(MemoryStore::new())).await
    }

    async fn app_on(store: Arc<MemoryStore>) -> App {
        let config = Config::try_parse_from(["llamachat"]).unwrap();
        AppBuilder::new(config).build_with_store(store).await
    }

    async fn run(app: &App, input: &str) -> String {
        let mut output = Vec::new();
        app.repl(input.as_bytes(), &mut output).await.unwrap();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn parses_commands() {
        assert_eq!(Command::parse("hello"), Command::Send("hello".to_string()));
        assert_eq!(Command::parse("  /new "), Command::New);
        assert_eq!(Command::parse("/open 2"), Command::Open("2".to_string()));
        assert_eq!(
            Command::parse("/search  rust lang"),
            Command::Search("rust lang".to_string())
        );
        assert_eq!(Command::parse("/theme dark"), Command::Theme(Theme::Dark));
        assert_eq!(Command::parse("/autotitle off"), Command::AutoTitle(false));
        assert_eq!(Command::parse("/exit"), Command::Quit);
        assert_eq!(Command::parse("/open"), Command::Invalid("/open".to_string()));
        assert_eq!(Command::parse("/theme blue"), Command::Invalid("/theme blue".to_string()));
    }

    #[tokio::test]
    async fn chat_session() {
        let app = app().await;
        assert!(app.model().snapshot().is_model_loaded);

        let out = run(&app, "Hello\n/list\n/quit\nignored\n").await;
        assert!(out.contains("Assistant: Mock response to: Human: Hello\n\nAssistant:"));
        assert!(out.contains("*  1. Hello (2 messages"));
        assert_eq!(app.chat().snapshot().messages.len(), 2);
    }

    #[tokio::test]
    async fn restart_restores_the_session() {
        let kv = Arc::new(MemoryStore::new());
        let first = app_on(kv.clone()).await;
        let out = run(&first, "Hello\n/new\nSecond\n/open 2\n").await;
        assert!(out.starts_with(WELCOME));
        first.model().update_config(|config| config.temperature = 0.2).await;
        let active = first.chat().snapshot().current_conversation_id;
        first.shutdown().await;

        let second = app_on(kv).await;
        let chat = second.chat().snapshot();
        assert!(active.is_some());
        assert_eq!(chat.current_conversation_id, active);
        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.messages[0].text, "Hello");

        let model = second.model().snapshot();
        assert!(model.is_model_loaded);
        assert_eq!(model.config.temperature, 0.2);
        assert_eq!(model.config.model_path, "bundled://model.gguf");

        assert!(!second.settings().snapshot().is_first_launch);
        let out = run(&second, "/quit\n").await;
        assert!(!out.contains(WELCOME));
    }

    #[tokio::test]
    async fn performance_reaches_the_model_store() {
        let app = app().await;
        let mut rx = app.model().subscribe();
        run(&app, "Hello\n").await;
        while rx.borrow_and_update().performance.is_none() {
            rx.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn open_and_delete_by_index() {
        let app = app().await;
        run(&app, "first\n/new\nsecond\n").await;
        // Newest first, so "first" is number 2.
        let out = run(&app, "/open 2\n").await;
        assert!(out.contains("Human: first"));
        assert_eq!(app.chat().snapshot().conversations[1].title, "first");

        run(&app, "/delete 2\n").await;
        let state = app.chat().snapshot();
        assert_eq!(state.conversations.len(), 1);
        assert_eq!(state.conversations[0].title, "second");
        assert!(state.current_conversation_id.is_none());

        let out = run(&app, "/open 9\n").await;
        assert!(out.contains("No conversation 9"));
    }

    #[tokio::test]
    async fn export_then_import() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chats.json");
        let source = app().await;
        run(&source, &format!("hi there\n/export {}\n", path.display())).await;

        let target = app().await;
        let out = run(&target, &format!("/import {}\n/stats\n", path.display())).await;
        assert!(out.contains("Imported 1 conversations"));
        assert!(out.contains("1 conversations, 2 messages"));
        assert_eq!(target.chat().snapshot().conversations[0].title, "hi there");
    }

    #[tokio::test]
    async fn settings_commands() {
        let app = app().await;
        run(&app, "/theme dark\n/autotitle off\nuntitled\n").await;
        let settings = app.settings().snapshot();
        assert_eq!(settings.theme, Theme::Dark);
        assert!(!settings.settings.auto_title);
        assert_eq!(app.chat().snapshot().conversations[0].title, "New Chat");

        run(&app, "/reset\n").await;
        assert!(app.chat().snapshot().conversations.is_empty());
        assert_eq!(app.settings().snapshot().theme, Theme::Light);
    }
}
