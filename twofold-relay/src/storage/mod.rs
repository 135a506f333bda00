//! SQLite storage backend for the relay.

pub mod models;

use crate::error::RelayError;
use models::Registration;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Thread-safe relay storage.
#[derive(Clone)]
pub struct RelayStorage {
    conn: Arc<Mutex<Connection>>,
}

impl RelayStorage {
    pub fn open(path: &Path) -> Result<Self, anyhow::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self, anyhow::Error> {
        let storage = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&self) -> Result<(), anyhow::Error> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rendezvous (
                peer_id TEXT PRIMARY KEY,
                addr TEXT NOT NULL,
                ticket TEXT NOT NULL,
                registered_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_rendezvous_expires
                ON rendezvous(expires_at);",
        )?;
        Ok(())
    }

    pub fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, RelayError> {
        self.conn
            .lock()
            .map_err(|e| RelayError::Internal(format!("Lock error: {}", e)))
    }

    /// Register a listening peer until `now + ttl_secs`.
    ///
    /// An id that is still active cannot be registered again, and at most
    /// `max_active` registrations may be live at once.
    pub fn register(
        &self,
        peer_id: &str,
        addr: &str,
        ticket: &str,
        now: i64,
        ttl_secs: i64,
        max_active: usize,
    ) -> Result<Registration, RelayError> {
        let conn = self.conn()?;

        conn.execute(
            "DELETE FROM rendezvous WHERE peer_id = ?1 AND expires_at <= ?2",
            rusqlite::params![peer_id, now],
        )?;

        let taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM rendezvous WHERE peer_id = ?1)",
            [peer_id],
            |row| row.get(0),
        )?;
        if taken {
            return Err(RelayError::Conflict(format!(
                "Peer id {} is already registered",
                peer_id
            )));
        }

        let active: i64 = conn.query_row(
            "SELECT COUNT(*) FROM rendezvous WHERE expires_at > ?1",
            [now],
            |row| row.get(0),
        )?;
        if active as usize >= max_active {
            return Err(RelayError::Conflict(
                "Too many active registrations".to_string(),
            ));
        }

        let registration = Registration {
            peer_id: peer_id.to_string(),
            addr: addr.to_string(),
            ticket: ticket.to_string(),
            registered_at: now,
            expires_at: now + ttl_secs,
        };
        conn.execute(
            "INSERT INTO rendezvous (peer_id, addr, ticket, registered_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                registration.peer_id,
                registration.addr,
                registration.ticket,
                registration.registered_at,
                registration.expires_at,
            ],
        )?;
        Ok(registration)
    }

    /// Look up a live registration and remove it. Each id resolves once.
    pub fn take(&self, peer_id: &str, now: i64) -> Result<Option<Registration>, RelayError> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT peer_id, addr, ticket, registered_at, expires_at FROM rendezvous
                 WHERE peer_id = ?1 AND expires_at > ?2",
                rusqlite::params![peer_id, now],
                |row| {
                    Ok(Registration {
                        peer_id: row.get(0)?,
                        addr: row.get(1)?,
                        ticket: row.get(2)?,
                        registered_at: row.get(3)?,
                        expires_at: row.get(4)?,
                    })
                },
            )
            .optional()?;

        conn.execute("DELETE FROM rendezvous WHERE peer_id = ?1", [peer_id])?;
        Ok(found)
    }

    /// Remove a registration. Returns whether one existed.
    pub fn withdraw(&self, peer_id: &str) -> Result<bool, RelayError> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM rendezvous WHERE peer_id = ?1", [peer_id])?;
        Ok(removed > 0)
    }

    /// Delete expired registrations and return how many were removed.
    pub fn prune_expired(&self, now: i64) -> Result<usize, RelayError> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM rendezvous WHERE expires_at <= ?1", [now])?;
        Ok(removed)
    }

    pub fn active_count(&self, now: i64) -> Result<usize, RelayError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM rendezvous WHERE expires_at > ?1",
            [now],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
