use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{Connection, OptionalExtension};

use crate::error::CacheError;

/// Best-effort key-value persistence shared by the asset cache and the
/// index snapshot.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;
    async fn set(&self, key: &str, value: Bytes) -> Result<(), CacheError>;
}

/// SQLite-backed store. Connection calls run on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the store file. The parent directory is created if needed.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CacheError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        // WAL first: busy readers must not block the snapshot writer.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             CREATE TABLE IF NOT EXISTS kv (
                 key        TEXT PRIMARY KEY,
                 value      BLOB NOT NULL,
                 updated_at INTEGER NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T, F>(conn: &Mutex<Connection>, f: F) -> Result<T, CacheError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let guard = conn
            .lock()
            .map_err(|e| CacheError::Unavailable(format!("connection lock poisoned: {e}")))?;
        Ok(f(&guard)?)
    }
}

#[async_trait]
impl PersistentStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let conn = Arc::clone(&self.conn);
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            Self::with_conn(&conn, |c| {
                c.query_row("SELECT value FROM kv WHERE key = ?1", [&key], |row| {
                    row.get::<_, Vec<u8>>(0)
                })
                .optional()
            })
        })
        .await?
        .map(|value| value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), CacheError> {
        let conn = Arc::clone(&self.conn);
        let key = key.to_string();
        let updated_at = chrono::Utc::now().timestamp_millis();
        tokio::task::spawn_blocking(move || {
            Self::with_conn(&conn, |c| {
                c.execute(
                    "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                    updated_at = excluded.updated_at",
                    rusqlite::params![key, value.as_ref(), updated_at],
                )
                .map(|_| ())
            })
        })
        .await?
    }
}

/// Process-local store. Nothing survives a restart unless the same
/// instance is shared.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<tokio::sync::Mutex<HashMap<String, Bytes>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.entries.lock().await.contains_key(key)
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), CacheError> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }
}
