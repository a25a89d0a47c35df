//! Durable record of processed events, plus per-relay resume cursors.

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS processed_notes (
    event_id     TEXT NOT NULL,
    recipient    TEXT NOT NULL,
    relay_url    TEXT NOT NULL,
    processed_at INTEGER NOT NULL DEFAULT (unixepoch()),
    PRIMARY KEY (event_id, recipient)
);
CREATE TABLE IF NOT EXISTS relay_cursors (
    relay_url TEXT PRIMARY KEY,
    since     INTEGER NOT NULL
);
";

/// One processed (event, recipient) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedRecord {
    pub event_id: String,
    pub recipient: String,
    pub relay_url: String,
    pub processed_at: i64,
}

/// Handle to the SQLite dedup database. Cheap to clone; every clone shares
/// one connection, so writes are serialized.
#[derive(Clone)]
pub struct DedupStore {
    conn: Arc<Mutex<Connection>>,
}

impl DedupStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::with_schema(conn)
    }

    /// In-memory database, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_schema(Connection::open_in_memory()?)
    }

    fn with_schema(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&guard).map_err(StoreError::from)
        })
        .await?
    }

    /// Has `event_id` been processed for any recipient?
    pub async fn has(&self, event_id: &str) -> Result<bool, StoreError> {
        let id = event_id.to_string();
        self.call(move |c| {
            c.query_row(
                "SELECT EXISTS(SELECT 1 FROM processed_notes WHERE event_id = ?1)",
                [id],
                |row| row.get(0),
            )
        })
        .await
    }

    /// Has `event_id` been processed for this recipient?
    pub async fn has_for(&self, event_id: &str, recipient: &str) -> Result<bool, StoreError> {
        let (id, to) = (event_id.to_string(), recipient.to_string());
        self.call(move |c| {
            c.query_row(
                "SELECT EXISTS(SELECT 1 FROM processed_notes WHERE event_id = ?1 AND recipient = ?2)",
                [id, to],
                |row| row.get(0),
            )
        })
        .await
    }

    /// Record (event, recipient) as processed. Returns `true` if this call
    /// inserted the record and `false` if it already existed, so concurrent
    /// callers racing on the same pair see exactly one winner.
    pub async fn mark(
        &self,
        event_id: &str,
        relay_url: &str,
        recipient: &str,
    ) -> Result<bool, StoreError> {
        let (id, relay, to) = (
            event_id.to_string(),
            relay_url.to_string(),
            recipient.to_string(),
        );
        self.call(move |c| {
            c.execute(
                "INSERT OR IGNORE INTO processed_notes (event_id, recipient, relay_url) VALUES (?1, ?2, ?3)",
                params![id, to, relay],
            )
            .map(|n| n == 1)
        })
        .await
    }

    /// Most recent records, newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<ProcessedRecord>, StoreError> {
        self.call(move |c| {
            let mut stmt = c.prepare(
                "SELECT event_id, recipient, relay_url, processed_at FROM processed_notes
                 ORDER BY processed_at DESC, rowid DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit as i64], |row| {
                Ok(ProcessedRecord {
                    event_id: row.get(0)?,
                    recipient: row.get(1)?,
                    relay_url: row.get(2)?,
                    processed_at: row.get(3)?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    /// Last `created_at` seen on `relay_url` in a previous run.
    pub async fn cursor(&self, relay_url: &str) -> Result<Option<u64>, StoreError> {
        let relay = relay_url.to_string();
        self.call(move |c| {
            c.query_row(
                "SELECT since FROM relay_cursors WHERE relay_url = ?1",
                [relay],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map(|v| v.map(|s| s.max(0) as u64))
        })
        .await
    }

    /// Advance the cursor for `relay_url`; never moves it backwards.
    pub async fn set_cursor(&self, relay_url: &str, since: u64) -> Result<(), StoreError> {
        let relay = relay_url.to_string();
        self.call(move |c| {
            c.execute(
                "INSERT INTO relay_cursors (relay_url, since) VALUES (?1, ?2)
                 ON CONFLICT(relay_url) DO UPDATE SET since = MAX(since, excluded.since)",
                params![relay, since as i64],
            )
            .map(|_| ())
        })
        .await
    }
}
