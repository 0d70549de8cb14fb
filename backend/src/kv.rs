use crate::entities::kv;
use async_trait::async_trait;
use log::debug;
use sea_orm::{sea_query::OnConflict, ActiveValue::Set, DatabaseConnection, EntityTrait};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Db error {0}")]
    DbError(#[from] sea_orm::DbErr),

    #[error("Key-value store is unavailable")]
    Unavailable,
}

/// String key-value storage the chat history is serialized into.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    async fn set(&self, key: &str, value: String) -> Result<(), Error>;

    /// Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), Error>;
}

pub struct SqliteStore {
    db: DatabaseConnection,
}

impl SqliteStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let row = kv::Entity::find_by_id(key.to_owned()).one(&self.db).await?;
        Ok(row.map(|row| row.value))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), Error> {
        debug!("Writing {} bytes into {key}", value.len());
        let row = kv::ActiveModel {
            key: Set(key.to_owned()),
            value: Set(value),
            updated_at: Set(chrono::Utc::now()),
        };
        kv::Entity::insert(row)
            .on_conflict(
                OnConflict::column(kv::Column::Key)
                    .update_columns([kv::Column::Value, kv::Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), Error> {
        kv::Entity::delete_by_id(key.to_owned())
            .exec(&self.db)
            .await?;
        Ok(())
    }
}

/// Volatile store, also used to simulate an unavailable device store.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// When unavailable every call fails with [`Error::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        self.check()?;
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), Error> {
        self.check()?;
        self.entries.lock().await.insert(key.to_owned(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), Error> {
        self.check()?;
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sqlite_set_is_an_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let db = crate::init_db(dir.path()).await.unwrap();
        let store = SqliteStore::new(db);

        assert_eq!(store.get("a").await.unwrap(), None);
        store.set("a", "1".to_string()).await.unwrap();
        store.set("a", "2".to_string()).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("2"));

        store.remove("a").await.unwrap();
        store.remove("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_store_can_be_made_unavailable() {
        let store = MemoryStore::new();
        store.set("k", "v".to_string()).await.unwrap();

        store.set_available(false);
        assert!(matches!(store.get("k").await, Err(Error::Unavailable)));
        assert!(matches!(
            store.set("k", "w".to_string()).await,
            Err(Error::Unavailable)
        ));

        store.set_available(true);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
