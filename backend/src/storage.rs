use crate::entities::{AppSettings, Conversation, Message};
use crate::kv::{self, KeyValueStore};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub const CONVERSATIONS_KEY: &str = "llamachat_conversations";
pub const MESSAGES_PREFIX: &str = "llamachat_messages_";
pub const SETTINGS_KEY: &str = "llamachat_settings";
pub const DEFAULT_MAX_CONVERSATIONS: usize = 100;

/// Parts of the stores' in-memory state that survive a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreSlice {
    Chat,
    Model,
    App,
}

impl StoreSlice {
    pub const ALL: [StoreSlice; 3] = [StoreSlice::Chat, StoreSlice::Model, StoreSlice::App];

    pub fn key(self) -> &'static str {
        match self {
            StoreSlice::Chat => "llamachat_store_chat",
            StoreSlice::Model => "llamachat_store_model",
            StoreSlice::App => "llamachat_store_app",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Kv(#[from] kv::Error),

    #[error("Serialization error {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid data format")]
    InvalidFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportData {
    pub conversations: Vec<Conversation>,
    pub messages: BTreeMap<String, Vec<Message>>,
}

#[derive(Deserialize)]
struct ImportData {
    conversations: Option<Vec<Conversation>>,
    messages: Option<HashMap<String, Vec<Message>>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub total_conversations: usize,
    pub total_messages: usize,
    pub estimated_size: usize,
}

fn messages_key(conversation_id: &str) -> String {
    format!("{MESSAGES_PREFIX}{conversation_id}")
}

/// Chat history persisted as JSON documents in a key-value store.
///
/// The conversation list lives under one key and every conversation's
/// messages under their own key. Each read-modify-write of one of those
/// documents holds a lock dedicated to it, so concurrent writers append
/// instead of overwriting each other.
pub struct Storage {
    store: Arc<dyn KeyValueStore>,
    max_conversations: usize,
    list_lock: Mutex<()>,
    message_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Storage {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            max_conversations: DEFAULT_MAX_CONVERSATIONS,
            list_lock: Mutex::new(()),
            message_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_max_conversations(mut self, max_conversations: usize) -> Self {
        self.max_conversations = max_conversations;
        self
    }

    pub fn max_conversations(&self) -> usize {
        self.max_conversations
    }

    async fn lock_messages(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .message_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(conversation_id.to_owned())
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drops the lock entry of `conversation_id` unless someone still holds
    /// or waits on it.
    fn forget_lock(&self, conversation_id: &str) {
        let mut locks = self
            .message_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(conversation_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(conversation_id);
        }
    }

    /// Removes the message list of a conversation that left the list.
    async fn remove_messages(&self, conversation_id: &str) -> Result<(), Error> {
        {
            let _guard = self.lock_messages(conversation_id).await;
            self.store.remove(&messages_key(conversation_id)).await?;
        }
        self.forget_lock(conversation_id);
        Ok(())
    }

    /// I/O errors propagate, an unreadable document reads as empty.
    async fn read_strict<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, Error> {
        match self.store.get(key).await? {
            None => Ok(T::default()),
            Some(data) => Ok(serde_json::from_str(&data).unwrap_or_else(|err| {
                warn!("Discarding unreadable document {key}: {err}");
                T::default()
            })),
        }
    }

    /// Reads a document, treating every failure as missing data.
    async fn read_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        match self.store.get(key).await {
            Ok(None) => T::default(),
            Ok(Some(data)) => serde_json::from_str(&data).unwrap_or_else(|err| {
                warn!("Ignoring unreadable document {key}: {err}");
                T::default()
            }),
            Err(err) => {
                warn!("Could not read {key}: {err}");
                T::default()
            }
        }
    }

    async fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), Error> {
        let data = serde_json::to_string(value)?;
        self.store.set(key, data).await?;
        Ok(())
    }

    /// Inserts or replaces by id, keeping the most recent conversations only.
    pub async fn save_conversation(&self, conversation: &Conversation) -> Result<(), Error> {
        let _guard = self.list_lock.lock().await;
        let mut conversations: Vec<Conversation> = self.read_strict(CONVERSATIONS_KEY).await?;
        conversations.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        match conversations.iter_mut().find(|c| c.id == conversation.id) {
            Some(existing) => *existing = conversation.clone(),
            None => conversations.insert(0, conversation.clone()),
        }
        let evicted = if conversations.len() > self.max_conversations {
            conversations.split_off(self.max_conversations)
        } else {
            vec![]
        };
        self.write(CONVERSATIONS_KEY, &conversations).await?;
        if !evicted.is_empty() {
            debug!("Evicting {} conversations", evicted.len());
        }
        for conversation in evicted {
            self.remove_messages(&conversation.id).await?;
        }
        Ok(())
    }

    pub async fn update_conversation(&self, conversation: &Conversation) -> Result<(), Error> {
        self.save_conversation(conversation).await
    }

    /// Most recent activity first.
    pub async fn get_all_conversations(&self) -> Vec<Conversation> {
        let mut conversations: Vec<Conversation> = self.read_or_default(CONVERSATIONS_KEY).await;
        conversations.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        conversations
    }

    /// Like [`Storage::get_all_conversations`] but reports I/O failures.
    pub async fn try_get_all_conversations(&self) -> Result<Vec<Conversation>, Error> {
        let mut conversations: Vec<Conversation> = self.read_strict(CONVERSATIONS_KEY).await?;
        conversations.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(conversations)
    }

    pub async fn save_message(&self, message: &Message) -> Result<(), Error> {
        let key = messages_key(&message.conversation_id);
        let _guard = self.lock_messages(&message.conversation_id).await;
        let mut messages: Vec<Message> = self.read_strict(&key).await?;
        messages.push(message.clone());
        self.write(&key, &messages).await
    }

    /// Oldest first.
    pub async fn get_conversation_messages(&self, conversation_id: &str) -> Vec<Message> {
        let mut messages: Vec<Message> = self.read_or_default(&messages_key(conversation_id)).await;
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        messages
    }

    /// Like [`Storage::get_conversation_messages`] but reports I/O failures.
    pub async fn try_get_conversation_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, Error> {
        let mut messages: Vec<Message> = self.read_strict(&messages_key(conversation_id)).await?;
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(messages)
    }

    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), Error> {
        {
            let _guard = self.list_lock.lock().await;
            let mut conversations: Vec<Conversation> =
                self.read_strict(CONVERSATIONS_KEY).await?;
            conversations.retain(|c| c.id != conversation_id);
            self.write(CONVERSATIONS_KEY, &conversations).await?;
        }
        self.remove_messages(conversation_id).await
    }

    pub async fn delete_message(
        &self,
        message_id: &str,
        conversation_id: &str,
    ) -> Result<(), Error> {
        let key = messages_key(conversation_id);
        let _guard = self.lock_messages(conversation_id).await;
        let mut messages: Vec<Message> = self.read_strict(&key).await?;
        messages.retain(|m| m.id != message_id);
        self.write(&key, &messages).await
    }

    /// Case-insensitive substring scan over every stored message, newest first.
    pub async fn search_messages(&self, query: &str) -> Vec<Message> {
        let query = query.to_lowercase();
        let mut found = vec![];
        for conversation in self.get_all_conversations().await {
            let messages = self.get_conversation_messages(&conversation.id).await;
            found.extend(
                messages
                    .into_iter()
                    .filter(|m| m.text.to_lowercase().contains(&query)),
            );
        }
        found.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        found
    }

    pub async fn save_settings(&self, settings: &AppSettings) -> Result<(), Error> {
        self.write(SETTINGS_KEY, settings).await
    }

    pub async fn load_settings(&self) -> AppSettings {
        self.read_or_default(SETTINGS_KEY).await
    }

    pub async fn save_slice<T: Serialize>(&self, slice: StoreSlice, value: &T) -> Result<(), Error> {
        self.write(slice.key(), value).await
    }

    /// `None` when the slice was never saved or cannot be read.
    pub async fn load_slice<T: DeserializeOwned>(&self, slice: StoreSlice) -> Option<T> {
        match self.store.get(slice.key()).await {
            Ok(Some(data)) => serde_json::from_str(&data)
                .map_err(|err| warn!("Ignoring unreadable {}: {err}", slice.key()))
                .ok(),
            Ok(None) => None,
            Err(err) => {
                warn!("Could not read {}: {err}", slice.key());
                None
            }
        }
    }

    pub async fn get_storage_stats(&self) -> Result<StorageStats, Error> {
        let mut stats = StorageStats::default();
        let conversations = self.get_all_conversations().await;
        stats.total_conversations = conversations.len();
        for conversation in &conversations {
            let messages = self.get_conversation_messages(&conversation.id).await;
            stats.total_messages += messages.len();
            stats.estimated_size += serde_json::to_string(conversation)?.len();
            stats.estimated_size += serde_json::to_string(&messages)?.len();
        }
        Ok(stats)
    }

    pub async fn clear_all_data(&self) -> Result<(), Error> {
        let _guard = self.list_lock.lock().await;
        let conversations: Vec<Conversation> = self.read_strict(CONVERSATIONS_KEY).await?;
        for conversation in conversations {
            self.store.remove(&messages_key(&conversation.id)).await?;
        }
        self.store.remove(CONVERSATIONS_KEY).await?;
        self.store.remove(SETTINGS_KEY).await?;
        for slice in StoreSlice::ALL {
            self.store.remove(slice.key()).await?;
        }
        info!("All data cleared");
        Ok(())
    }

    pub async fn export_data(&self) -> Result<String, Error> {
        let conversations = self.get_all_conversations().await;
        let mut messages = BTreeMap::new();
        for conversation in &conversations {
            let list = self.get_conversation_messages(&conversation.id).await;
            messages.insert(conversation.id.clone(), list);
        }
        let data = ExportData {
            conversations,
            messages,
        };
        Ok(serde_json::to_string_pretty(&data)?)
    }

    /// Replaces the conversation list and the message lists present in `json`.
    pub async fn import_data(&self, json: &str) -> Result<(), Error> {
        let data: ImportData = serde_json::from_str(json)?;
        let (Some(conversations), Some(messages)) = (data.conversations, data.messages) else {
            return Err(Error::InvalidFormat);
        };
        {
            let _guard = self.list_lock.lock().await;
            self.write(CONVERSATIONS_KEY, &conversations).await?;
        }
        for (conversation_id, list) in messages {
            let _guard = self.lock_messages(&conversation_id).await;
            self.write(&messages_key(&conversation_id), &list).await?;
        }
        info!("Imported {} conversations", conversations.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use chrono::Duration;

    fn memory() -> (Arc<MemoryStore>, Storage) {
        let store = Arc::new(MemoryStore::new());
        let storage = Storage::new(store.clone());
        (store, storage)
    }

    fn conversation_at(offset_secs: i64) -> Conversation {
        let mut conversation = Conversation::new();
        conversation.timestamp += Duration::seconds(offset_secs);
        conversation
    }

    fn message_at(conversation_id: &str, text: &str, offset_secs: i64) -> Message {
        let mut message = Message::user(conversation_id, text);
        message.timestamp += Duration::seconds(offset_secs);
        message
    }

    #[tokio::test]
    async fn missing_keys_read_as_empty() {
        let (_, storage) = memory();
        assert!(storage.get_all_conversations().await.is_empty());
        assert!(storage.get_conversation_messages("nope").await.is_empty());
        assert!(storage.search_messages("x").await.is_empty());
    }

    #[tokio::test]
    async fn save_conversation_replaces_by_id() {
        let (_, storage) = memory();
        let mut conversation = Conversation::new();
        storage.save_conversation(&conversation).await.unwrap();
        conversation.title = "Renamed".to_string();
        storage.update_conversation(&conversation).await.unwrap();

        let all = storage.get_all_conversations().await;
        assert_eq!(all, vec![conversation]);
    }

    #[tokio::test]
    async fn conversations_are_capped_and_oldest_evicted() {
        let (_, storage) = memory();
        let mut ids = vec![];
        for i in 0..101 {
            let conversation = conversation_at(i);
            ids.push(conversation.id.clone());
            storage.save_conversation(&conversation).await.unwrap();
        }
        let all = storage.get_all_conversations().await;
        assert_eq!(all.len(), 100);
        assert!(!all.iter().any(|c| c.id == ids[0]));
        assert_eq!(all[0].id, ids[100]);
    }

    #[tokio::test]
    async fn cap_evicts_first_saved_with_equal_timestamps() {
        let (_, storage) = memory();
        let template = Conversation::new();
        let mut ids = vec![];
        for _ in 0..101 {
            let conversation = Conversation {
                id: uuid::Uuid::new_v4().to_string(),
                ..template.clone()
            };
            ids.push(conversation.id.clone());
            storage.save_conversation(&conversation).await.unwrap();
        }
        let all = storage.get_all_conversations().await;
        assert_eq!(all.len(), 100);
        assert!(!all.iter().any(|c| c.id == ids[0]));
    }

    #[tokio::test]
    async fn listings_are_ordered_by_timestamp() {
        let (_, storage) = memory();
        for offset in [5, -3, 12, 0] {
            storage
                .save_conversation(&conversation_at(offset))
                .await
                .unwrap();
        }
        let all = storage.get_all_conversations().await;
        assert!(all.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));

        for offset in [7, -1, 3, 3, 0] {
            storage
                .save_message(&message_at("c", "hi", offset))
                .await
                .unwrap();
        }
        let messages = storage.get_conversation_messages("c").await;
        assert_eq!(messages.len(), 5);
        assert!(messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn delete_conversation_removes_its_messages() {
        let (_, storage) = memory();
        let keep = Conversation::new();
        let drop = Conversation::new();
        for conversation in [&keep, &drop] {
            storage.save_conversation(conversation).await.unwrap();
            storage
                .save_message(&Message::user(&conversation.id, "hello"))
                .await
                .unwrap();
        }

        storage.delete_conversation(&drop.id).await.unwrap();

        assert!(storage.get_conversation_messages(&drop.id).await.is_empty());
        assert_eq!(storage.get_conversation_messages(&keep.id).await.len(), 1);
        assert_eq!(storage.get_all_conversations().await, vec![keep]);
    }

    #[tokio::test]
    async fn delete_message_removes_only_that_message() {
        let (_, storage) = memory();
        let first = Message::user("c", "first");
        let second = Message::assistant("c", "second", Some(3));
        storage.save_message(&first).await.unwrap();
        storage.save_message(&second).await.unwrap();

        storage.delete_message(&first.id, "c").await.unwrap();

        assert_eq!(storage.get_conversation_messages("c").await, vec![second]);
    }

    #[tokio::test]
    async fn search_is_case_insensitive_across_conversations() {
        let (_, storage) = memory();
        let a = conversation_at(0);
        let b = conversation_at(1);
        storage.save_conversation(&a).await.unwrap();
        storage.save_conversation(&b).await.unwrap();
        storage
            .save_message(&message_at(&a.id, "Rust is FUN", 0))
            .await
            .unwrap();
        storage
            .save_message(&message_at(&b.id, "more rust please", 10))
            .await
            .unwrap();
        storage
            .save_message(&message_at(&b.id, "nothing here", 20))
            .await
            .unwrap();

        let found = storage.search_messages("RUST").await;
        let texts: Vec<_> = found.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["more rust please", "Rust is FUN"]);
    }

    #[tokio::test]
    async fn concurrent_appends_are_not_lost() {
        let (_, storage) = memory();
        let storage = Arc::new(storage);
        let mut handles = vec![];
        for i in 0..20 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                storage
                    .save_message(&Message::user("shared", &format!("m{i}")))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(storage.get_conversation_messages("shared").await.len(), 20);
    }

    #[tokio::test]
    async fn export_import_round_trip() {
        let (_, source) = memory();
        let conversation = Conversation::new();
        source.save_conversation(&conversation).await.unwrap();
        source
            .save_message(&Message::user(&conversation.id, "Hello"))
            .await
            .unwrap();
        source
            .save_message(&Message::assistant(&conversation.id, "Hi there", Some(5)))
            .await
            .unwrap();
        let exported = source.export_data().await.unwrap();

        let (_, target) = memory();
        target.import_data(&exported).await.unwrap();

        assert_eq!(
            target.get_all_conversations().await,
            source.get_all_conversations().await
        );
        assert_eq!(
            target.get_conversation_messages(&conversation.id).await,
            source.get_conversation_messages(&conversation.id).await
        );
        assert_eq!(target.export_data().await.unwrap(), exported);
    }

    #[tokio::test]
    async fn export_uses_epoch_milliseconds() {
        let (_, storage) = memory();
        let conversation = Conversation::new();
        storage.save_conversation(&conversation).await.unwrap();
        let exported: serde_json::Value =
            serde_json::from_str(&storage.export_data().await.unwrap()).unwrap();
        assert_eq!(
            exported["conversations"][0]["timestamp"],
            serde_json::json!(conversation.timestamp.timestamp_millis())
        );
        assert!(exported["messages"][&conversation.id].is_array());
    }

    #[tokio::test]
    async fn import_rejects_incomplete_documents() {
        let (_, storage) = memory();
        assert!(matches!(
            storage.import_data(r#"{"conversations": []}"#).await,
            Err(Error::InvalidFormat)
        ));
        assert!(matches!(
            storage.import_data("not json").await,
            Err(Error::Json(_))
        ));
    }

    #[tokio::test]
    async fn writes_fail_and_reads_are_empty_when_unavailable() {
        let (store, storage) = memory();
        storage
            .save_conversation(&Conversation::new())
            .await
            .unwrap();
        store.set_available(false);

        assert!(matches!(
            storage.save_conversation(&Conversation::new()).await,
            Err(Error::Kv(kv::Error::Unavailable))
        ));
        assert!(matches!(
            storage.save_message(&Message::user("c", "x")).await,
            Err(Error::Kv(_))
        ));
        assert!(storage.get_all_conversations().await.is_empty());
        assert!(storage.try_get_all_conversations().await.is_err());
        assert!(storage.try_get_conversation_messages("c").await.is_err());
        assert_eq!(storage.load_settings().await, AppSettings::default());
    }

    #[tokio::test]
    async fn settings_default_then_round_trip() {
        let (_, storage) = memory();
        assert_eq!(storage.load_settings().await, AppSettings::default());

        let settings = AppSettings {
            dark_mode: true,
            max_conversations: 10,
            ..Default::default()
        };
        storage.save_settings(&settings).await.unwrap();
        assert_eq!(storage.load_settings().await, settings);
    }

    #[tokio::test]
    async fn stats_and_clear_all() {
        let (_, storage) = memory();
        let conversation = Conversation::new();
        storage.save_conversation(&conversation).await.unwrap();
        storage
            .save_message(&Message::user(&conversation.id, "one"))
            .await
            .unwrap();
        storage
            .save_message(&Message::user(&conversation.id, "two"))
            .await
            .unwrap();
        storage.save_settings(&AppSettings::default()).await.unwrap();

        let stats = storage.get_storage_stats().await.unwrap();
        assert_eq!(stats.total_conversations, 1);
        assert_eq!(stats.total_messages, 2);
        assert!(stats.estimated_size > 0);

        storage.clear_all_data().await.unwrap();
        assert_eq!(
            storage.get_storage_stats().await.unwrap(),
            StorageStats::default()
        );
        assert!(storage
            .get_conversation_messages(&conversation.id)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn eviction_removes_message_lists() {
        let (store, storage) = memory();
        let storage = storage.with_max_conversations(2);
        let oldest = conversation_at(0);
        storage.save_conversation(&oldest).await.unwrap();
        storage
            .save_message(&Message::user(&oldest.id, "old"))
            .await
            .unwrap();
        storage.save_conversation(&conversation_at(1)).await.unwrap();
        storage.save_conversation(&conversation_at(2)).await.unwrap();

        assert_eq!(storage.get_all_conversations().await.len(), 2);
        assert_eq!(store.get(&messages_key(&oldest.id)).await.unwrap(), None);
        assert!(storage.search_messages("old").await.is_empty());
    }

    #[tokio::test]
    async fn lock_entry_survives_while_held() {
        let (_, storage) = memory();
        let held = storage.lock_messages("c").await;
        storage.forget_lock("c");
        assert!(storage.message_locks.lock().unwrap().contains_key("c"));

        drop(held);
        storage.forget_lock("c");
        assert!(!storage.message_locks.lock().unwrap().contains_key("c"));
    }

    #[tokio::test]
    async fn delete_does_not_split_a_waited_on_lock() {
        let (_, storage) = memory();
        let storage = Arc::new(storage);
        let conversation = Conversation::new();
        storage.save_conversation(&conversation).await.unwrap();

        let held = storage.lock_messages(&conversation.id).await;
        let delete = tokio::spawn({
            let storage = storage.clone();
            let id = conversation.id.clone();
            async move { storage.delete_conversation(&id).await }
        });
        let append = tokio::spawn({
            let storage = storage.clone();
            let message = Message::user(&conversation.id, "late");
            async move { storage.save_message(&message).await }
        });
        tokio::task::yield_now().await;
        drop(held);
        delete.await.unwrap().unwrap();
        append.await.unwrap().unwrap();

        // Both went through the same lock, so neither worked on a stale list.
        let messages = storage.get_conversation_messages(&conversation.id).await;
        assert!(messages.len() <= 1);
        assert!(storage.message_locks.lock().unwrap().len() <= 1);
    }

    #[tokio::test]
    async fn slices_round_trip_and_are_cleared() {
        let (_, storage) = memory();
        assert_eq!(storage.load_slice::<Vec<String>>(StoreSlice::Chat).await, None);
        for slice in StoreSlice::ALL {
            storage
                .save_slice(slice, &vec![slice.key().to_string()])
                .await
                .unwrap();
        }
        assert_eq!(
            storage.load_slice::<Vec<String>>(StoreSlice::Model).await,
            Some(vec!["llamachat_store_model".to_string()])
        );

        storage.clear_all_data().await.unwrap();
        for slice in StoreSlice::ALL {
            assert_eq!(storage.load_slice::<Vec<String>>(slice).await, None);
        }
    }

    #[tokio::test]
    async fn unreadable_slice_loads_as_none() {
        let (store, storage) = memory();
        store
            .set(StoreSlice::App.key(), "{not json".to_string())
            .await
            .unwrap();
        assert_eq!(storage.load_slice::<Vec<String>>(StoreSlice::App).await, None);
    }

    #[tokio::test]
    async fn sqlite_backed_storage_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let conversation = Conversation::new();
        {
            let db = crate::init_db(dir.path()).await.unwrap();
            let storage = Storage::new(Arc::new(crate::kv::SqliteStore::new(db)));
            storage.save_conversation(&conversation).await.unwrap();
            storage
                .save_message(&Message::user(&conversation.id, "persisted"))
                .await
                .unwrap();
        }
        let db = crate::init_db(dir.path()).await.unwrap();
        let storage = Storage::new(Arc::new(crate::kv::SqliteStore::new(db)));
        assert_eq!(storage.get_all_conversations().await, vec![conversation.clone()]);
        let messages = storage.get_conversation_messages(&conversation.id).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "persisted");
    }
}
