//! Secret store contract and its two implementations.
//!
//! The engine only relies on the key-value contract of [`SecretStore`].
//! [`MemoryStore`] backs tests and ephemeral sessions, [`SqliteStore`] is the
//! durable store used by the CLI.

use crate::{Result, TwofoldError};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::RwLock;

/// One stored TOTP seed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub id: String,
    pub secret: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub order: i64,
}

impl std::fmt::Debug for SecretRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretRecord")
            .field("id", &self.id)
            .field("secret", &"[REDACTED]")
            .field("title", &self.title)
            .field("description", &self.description)
            .field("order", &self.order)
            .finish()
    }
}

/// Key-value contract (id → record) the engine reads and writes.
///
/// `list_ids` makes no ordering promise; callers sort by `order`.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<SecretRecord>>;

    /// Insert or replace the record stored under `id`.
    async fn put(&self, id: &str, record: &SecretRecord) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn list_ids(&self) -> Result<Vec<String>>;

    async fn has_secrets(&self) -> Result<bool> {
        Ok(!self.list_ids().await?.is_empty())
    }
}

/// In-memory store.
///
/// Individual ids can be marked as failing to exercise per-item error
/// handling.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, SecretRecord>>,
    failing_writes: Mutex<HashSet<String>>,
    failing_reads: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `put` for `id` fail with a storage error.
    pub fn fail_writes_for(&self, id: &str) {
        if let Ok(mut ids) = self.failing_writes.lock() {
            ids.insert(id.to_string());
        }
    }

    /// Make every `get` for `id` fail with a storage error.
    pub fn fail_reads_for(&self, id: &str) {
        if let Ok(mut ids) = self.failing_reads.lock() {
            ids.insert(id.to_string());
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn is_marked(set: &Mutex<HashSet<String>>, id: &str) -> bool {
        set.lock().map(|ids| ids.contains(id)).unwrap_or(false)
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<SecretRecord>> {
        if Self::is_marked(&self.failing_reads, id) {
            return Err(TwofoldError::Storage(format!("Failed to read {}", id)));
        }
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn put(&self, id: &str, record: &SecretRecord) -> Result<()> {
        if Self::is_marked(&self.failing_writes, id) {
            return Err(TwofoldError::Storage(format!("Failed to write {}", id)));
        }
        let mut stored = record.clone();
        stored.id = id.to_string();
        self.records.write().await.insert(id.to_string(), stored);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        Ok(self.records.read().await.keys().cloned().collect())
    }
}

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS secrets (
                id TEXT PRIMARY KEY,
                secret TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                sort_order INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| TwofoldError::Storage(format!("Lock error: {}", e)))
    }
}

#[async_trait]
impl SecretStore for SqliteStore {
    async fn get(&self, id: &str) -> Result<Option<SecretRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT id, secret, title, description, sort_order FROM secrets WHERE id = ?1",
                [id],
                |row| {
                    Ok(SecretRecord {
                        id: row.get(0)?,
                        secret: row.get(1)?,
                        title: row.get(2)?,
                        description: row.get(3)?,
                        order: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    async fn put(&self, id: &str, record: &SecretRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO secrets (id, secret, title, description, sort_order, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                secret = excluded.secret,
                title = excluded.title,
                description = excluded.description,
                sort_order = excluded.sort_order,
                updated_at = excluded.updated_at",
            params![
                id,
                record.secret,
                record.title,
                record.description,
                record.order,
                chrono::Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM secrets WHERE id = ?1", [id])?;
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM secrets")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}
