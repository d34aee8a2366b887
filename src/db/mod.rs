use crate::error::PollResult;
use crate::models::LocalSelection;
use async_trait::async_trait;
use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// String key/value medium, the client-side equivalent of browser local storage.
#[async_trait]
pub trait LocalStorage: Send + Sync {
    async fn get_item(&self, key: &str) -> PollResult<Option<String>>;
    async fn set_item(&self, key: &str, value: &str) -> PollResult<()>;
    async fn remove_item(&self, key: &str) -> PollResult<()>;
}

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn connect(url: &str) -> PollResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        // In-memory databases are per connection, so keep a single one
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Self::init_schema(&pool).await?;
        info!("Local storage ready at {}", url);

        Ok(Self { pool })
    }

    async fn init_schema(pool: &SqlitePool) -> PollResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS local_storage (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LocalStorage for SqliteStorage {
    async fn get_item(&self, key: &str) -> PollResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM local_storage WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get::<String, _>("value")))
    }

    async fn set_item(&self, key: &str, value: &str) -> PollResult<()> {
        sqlx::query(
            r#"
            INSERT INTO local_storage (key, value)
            VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> PollResult<()> {
        sqlx::query("DELETE FROM local_storage WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStorage for MemoryStorage {
    async fn get_item(&self, key: &str) -> PollResult<Option<String>> {
        Ok(self.items.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> PollResult<()> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> PollResult<()> {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
        Ok(())
    }
}

pub const MEMORY_STORAGE: &str = "memory";

pub fn token_key(poll_id: i64) -> String {
    format!("voterToken:{}", poll_id)
}

pub fn last_option_key(poll_id: i64) -> String {
    format!("votedOptionId:{}", poll_id)
}

/// Per-poll voter markers on top of an optional storage medium.
/// Without a medium every read is empty and every write is skipped.
#[derive(Clone, Default)]
pub struct VoterStore {
    storage: Option<Arc<dyn LocalStorage>>,
}

impl VoterStore {
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self { storage: Some(storage) }
    }

    pub fn unavailable() -> Self {
        Self { storage: None }
    }

    /// `memory` keeps markers for this process only; anything else is a SQLite URL.
    pub async fn open(url: Option<&str>) -> PollResult<Self> {
        match url {
            Some(MEMORY_STORAGE) => Ok(Self::new(Arc::new(MemoryStorage::new()))),
            Some(url) => Ok(Self::new(Arc::new(SqliteStorage::connect(url).await?))),
            None => {
                info!("Local storage disabled; voter markers will not be kept");
                Ok(Self::unavailable())
            }
        }
    }

    /// Reads this voter's markers for a poll. `None` when there is no
    /// medium to ask, as opposed to a medium holding nothing.
    pub async fn hydrate(&self, poll_id: i64) -> PollResult<Option<LocalSelection>> {
        let Some(storage) = &self.storage else {
            return Ok(None);
        };

        let voter_token = storage
            .get_item(&token_key(poll_id))
            .await?
            .filter(|token| !token.is_empty());
        let last_voted_option_id = storage
            .get_item(&last_option_key(poll_id))
            .await?
            .and_then(|raw| raw.trim().parse::<i64>().ok());

        debug!(
            "Hydrated poll {}: token={} last_option={:?}",
            poll_id,
            voter_token.is_some(),
            last_voted_option_id
        );
        Ok(Some(LocalSelection { voter_token, last_voted_option_id }))
    }

    pub async fn persist(
        &self,
        poll_id: i64,
        voter_token: Option<&str>,
        last_voted_option_id: Option<i64>,
    ) -> PollResult<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };

        if let Some(token) = voter_token.filter(|token| !token.is_empty()) {
            storage.set_item(&token_key(poll_id), token).await?;
        }
        match last_voted_option_id {
            Some(option_id) => {
                storage
                    .set_item(&last_option_key(poll_id), &option_id.to_string())
                    .await?
            }
            None => storage.remove_item(&last_option_key(poll_id)).await?,
        }
        Ok(())
    }
}
