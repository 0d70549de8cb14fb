use crate::state::{ChatState, PersistedChat};
use llamachat_backend::storage::{self, Storage, StoreSlice};
use llamachat_backend::{Conversation, LlmService, Message};
use log::{debug, error, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Number of trailing messages sent to the model as context.
pub const CONTEXT_WINDOW: usize = 10;
pub const TITLE_MAX_CHARS: usize = 50;
/// How long an error stays in [`ChatState::error`].
pub const ERROR_DISPLAY: Duration = Duration::from_secs(5);
pub const APOLOGY: &str =
    "Sorry, I encountered an error while processing your message. Please try again.";
pub const SEND_FAILED: &str = "Failed to generate response. Please try again.";
pub const LOAD_CONVERSATION_FAILED: &str = "Failed to load conversation";
pub const LOAD_CONVERSATIONS_FAILED: &str = "Failed to load conversations";

enum Write {
    Conversation(Conversation),
    Message(Message),
    Active(PersistedChat),
    Flush(oneshot::Sender<()>),
}

/// Applies writes one at a time in the order they were queued.
async fn write_behind(storage: Arc<Storage>, mut rx: mpsc::UnboundedReceiver<Write>) {
    while let Some(write) = rx.recv().await {
        let result = match write {
            Write::Conversation(conversation) => storage.save_conversation(&conversation).await,
            Write::Message(message) => storage.save_message(&message).await,
            Write::Active(active) => storage.save_slice(StoreSlice::Chat, &active).await,
            Write::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };
        if let Err(err) = result {
            warn!("Persisting chat state failed: {err}");
        }
    }
    debug!("Write queue closed");
}

/// First `TITLE_MAX_CHARS` characters of `text`, with `...` when cut.
pub fn derive_title(text: &str) -> String {
    let mut chars = text.chars();
    let title: String = chars.by_ref().take(TITLE_MAX_CHARS).collect();
    if chars.next().is_some() {
        format!("{title}...")
    } else {
        title
    }
}

struct Inner {
    state: watch::Sender<ChatState>,
    storage: Arc<Storage>,
    llm: Arc<LlmService>,
    writes: mpsc::UnboundedSender<Write>,
    error_generation: AtomicU64,
    auto_title: AtomicBool,
}

/// Conversation list, active conversation and its messages.
///
/// The in-memory state is authoritative: mutations apply immediately and
/// are persisted in the background through an ordered write queue.
/// Consumers observe it through [`ConversationStore::subscribe`].
///
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<Inner>,
}

impl ConversationStore {
    pub fn new(storage: Arc<Storage>, llm: Arc<LlmService>) -> Self {
        let (writes, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_behind(storage.clone(), rx));
        let (state, _) = watch::channel(ChatState::default());
        Self {
            inner: Arc::new(Inner {
                state,
                storage,
                llm,
                writes,
                error_generation: AtomicU64::new(0),
                auto_title: AtomicBool::new(true),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatState> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> ChatState {
        self.inner.state.borrow().clone()
    }

    pub fn set_auto_title(&self, auto_title: bool) {
        self.inner.auto_title.store(auto_title, Ordering::SeqCst);
    }

    fn update(&self, f: impl FnOnce(&mut ChatState)) {
        self.inner.state.send_modify(f);
    }

    fn persist(&self, write: Write) {
        if self.inner.writes.send(write).is_err() {
            error!("Write queue is closed, dropping write");
        }
    }

    fn persist_active(&self) {
        let current_conversation_id = self.inner.state.borrow().current_conversation_id.clone();
        self.persist(Write::Active(PersistedChat {
            current_conversation_id,
        }));
    }

    /// Waits until every write queued so far has been applied.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.persist(Write::Flush(done));
        let _ = wait.await;
    }

    /// Shows `message` and clears it after [`ERROR_DISPLAY`] unless another
    /// error replaced it meanwhile.
    fn set_error(&self, message: &str) {
        let generation = self.inner.error_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.update(|state| state.error = Some(message.to_string()));
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(ERROR_DISPLAY).await;
            if let Some(inner) = inner.upgrade() {
                if inner.error_generation.load(Ordering::SeqCst) == generation {
                    inner.state.send_modify(|state| state.error = None);
                }
            }
        });
    }

    pub fn clear_error(&self) {
        self.update(|state| state.error = None);
    }

    pub fn set_typing(&self, is_typing: bool) {
        self.update(|state| state.is_typing = is_typing);
    }

    pub fn create_new_conversation(&self) -> String {
        let conversation = Conversation::new();
        let id = conversation.id.clone();
        self.update(|state| {
            state.conversations.insert(0, conversation.clone());
            state.current_conversation_id = Some(id.clone());
            state.messages.clear();
        });
        self.persist(Write::Conversation(conversation));
        self.persist_active();
        id
    }

    pub async fn select_conversation(&self, conversation_id: &str) {
        let known = self
            .inner
            .state
            .borrow()
            .conversations
            .iter()
            .any(|c| c.id == conversation_id);
        if !known {
            return;
        }
        self.update(|state| {
            state.current_conversation_id = Some(conversation_id.to_string());
            state.is_loading = true;
        });
        self.persist_active();

        self.flush().await;
        match self
            .inner
            .storage
            .try_get_conversation_messages(conversation_id)
            .await
        {
            Ok(messages) => self.update(|state| {
                if state.current_conversation_id.as_deref() == Some(conversation_id) {
                    state.messages = messages;
                }
                state.is_loading = false;
            }),
            Err(err) => {
                warn!("Error loading conversation messages: {err}");
                self.update(|state| state.is_loading = false);
                self.set_error(LOAD_CONVERSATION_FAILED);
            }
        }
    }

    /// Appends to the active messages when `message` belongs to the active
    /// conversation and updates its conversation's metadata. Messages of a
    /// conversation that is no longer listed are dropped.
    pub fn add_message(&self, message: Message) {
        let mut updated = None;
        self.update(|state| {
            if state.current_conversation_id.as_deref() == Some(message.conversation_id.as_str()) {
                state.messages.push(message.clone());
            }
            if let Some(conversation) = state
                .conversations
                .iter_mut()
                .find(|c| c.id == message.conversation_id)
            {
                conversation.last_message = message.text.clone();
                conversation.timestamp = message.timestamp;
                conversation.message_count += 1;
                conversation.updated_at = llamachat_backend::entities::now();
                updated = Some(conversation.clone());
            }
        });
        match updated {
            Some(conversation) => {
                self.persist(Write::Message(message));
                self.persist(Write::Conversation(conversation));
            }
            None => debug!("Dropping message for unknown conversation {}", message.conversation_id),
        }
    }

    pub async fn send_message(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let current = self.inner.state.borrow().current_conversation_id.clone();
        let conversation_id = match current {
            Some(id) => id,
            None => self.create_new_conversation(),
        };

        self.add_message(Message::user(&conversation_id, text));
        self.update(|state| {
            state.is_typing = true;
            state.error = None;
        });

        let context: Vec<Message> = {
            let state = self.inner.state.borrow();
            let start = state.messages.len().saturating_sub(CONTEXT_WINDOW);
            state.messages[start..].to_vec()
        };
        let response = self.inner.llm.generate_response(&context, None, None).await;

        if response.success {
            let reply = Message::assistant(
                &conversation_id,
                &response.text,
                Some(response.usage.completion_tokens),
            );
            self.add_message(reply);
            self.update(|state| state.last_performance = Some(response.performance));
        } else {
            warn!(
                "Error generating LLM response: {}",
                response.error.as_deref().unwrap_or("unknown error")
            );
            self.set_error(SEND_FAILED);
            self.add_message(Message::assistant(&conversation_id, APOLOGY, None));
        }

        // The first exchange names the conversation, apology included.
        let count = self
            .inner
            .state
            .borrow()
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .map(|c| c.message_count);
        if count == Some(2) && self.inner.auto_title.load(Ordering::SeqCst) {
            self.update_conversation_title(&conversation_id, &derive_title(text));
        }
        self.set_typing(false);
    }

    pub fn update_conversation_title(&self, conversation_id: &str, title: &str) {
        let mut updated = None;
        self.update(|state| {
            if let Some(conversation) = state
                .conversations
                .iter_mut()
                .find(|c| c.id == conversation_id)
            {
                conversation.title = title.to_string();
                conversation.updated_at = llamachat_backend::entities::now();
                updated = Some(conversation.clone());
            }
        });
        if let Some(conversation) = updated {
            self.persist(Write::Conversation(conversation));
        }
    }

    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), storage::Error> {
        self.update(|state| {
            state.conversations.retain(|c| c.id != conversation_id);
            if state.current_conversation_id.as_deref() == Some(conversation_id) {
                state.current_conversation_id = None;
                state.messages.clear();
            }
        });
        self.persist_active();
        // Earlier queued writes for this conversation must land first.
        self.flush().await;
        self.inner.storage.delete_conversation(conversation_id).await
    }

    /// Replaces the in-memory list with the persisted one. The active
    /// conversation is dropped when it is no longer persisted.
    pub async fn load_conversations(&self) {
        self.update(|state| state.is_loading = true);
        self.flush().await;
        match self.inner.storage.try_get_all_conversations().await {
            Ok(conversations) => {
                let mut dropped = false;
                self.update(|state| {
                    let active = state.current_conversation_id.as_deref();
                    if active.is_some()
                        && !conversations.iter().any(|c| Some(c.id.as_str()) == active)
                    {
                        state.current_conversation_id = None;
                        state.messages.clear();
                        dropped = true;
                    }
                    state.conversations = conversations;
                    state.is_loading = false;
                });
                if dropped {
                    self.persist_active();
                }
            }
            Err(err) => {
                warn!("Error loading conversations: {err}");
                self.update(|state| state.is_loading = false);
                self.set_error(LOAD_CONVERSATIONS_FAILED);
            }
        }
    }

    /// Reopens the conversation that was active when the state was last
    /// persisted, if it still exists.
    pub async fn restore_active_conversation(&self) {
        let saved: Option<PersistedChat> =
            self.inner.storage.load_slice(StoreSlice::Chat).await;
        if let Some(id) = saved.and_then(|saved| saved.current_conversation_id) {
            debug!("Restoring conversation {id}");
            self.select_conversation(&id).await;
        }
    }

    pub async fn search_messages(&self, query: &str) -> Vec<Message> {
        self.flush().await;
        self.inner.storage.search_messages(query).await
    }
}
