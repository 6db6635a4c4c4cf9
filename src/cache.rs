//! Dedup cache: remembers which items have already been submitted.
//!
//! Keys are `(namespace, item_key)` where the namespace is the source name
//! and the item key is the candidate's resource URL.  Each namespace is
//! independent; nothing is ever expired or deleted by the poller.
//!
//! The durable implementation is a single SQLite table.  A write is
//! committed before [`DedupCache::store`] returns.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::warn;

use crate::descriptor::ResultDescriptor;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to encode descriptor: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to create cache directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache connection lock poisoned")]
    Poisoned,
    #[error("cache is closed")]
    Closed,
    #[error("cache task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Durable record of submitted items.
pub trait DedupCache: Send + Sync {
    /// The descriptor recorded for this key, if any.
    ///
    /// Never fails: a missing key, an unreadable record, or a storage error
    /// all report "not found".
    fn load(&self, namespace: &str, item_key: &str) -> Option<ResultDescriptor>;

    /// Record `descriptor` for this key, overwriting any previous value.
    fn store(
        &self,
        namespace: &str,
        item_key: &str,
        descriptor: &ResultDescriptor,
    ) -> Result<(), CacheError>;

    fn close(&self) -> Result<(), CacheError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS dispatched (
    namespace  TEXT    NOT NULL,
    item_key   TEXT    NOT NULL,
    descriptor TEXT    NOT NULL,
    stored_at  INTEGER NOT NULL,
    PRIMARY KEY (namespace, item_key)
);
";

pub struct SqliteCache {
    conn: Mutex<Option<Connection>>,
}

impl SqliteCache {
    pub fn open(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Every item key recorded for one namespace, oldest first.
    pub fn entries(&self, namespace: &str) -> Result<Vec<String>, CacheError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT item_key FROM dispatched WHERE namespace = ?1 ORDER BY stored_at, item_key",
            )?;
            let keys = stmt
                .query_map(params![namespace], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(keys)
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(CacheError::Closed),
        }
    }
}

impl DedupCache for SqliteCache {
    fn load(&self, namespace: &str, item_key: &str) -> Option<ResultDescriptor> {
        let raw = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT descriptor FROM dispatched WHERE namespace = ?1 AND item_key = ?2",
                    params![namespace, item_key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?)
        });

        let raw = match raw {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(namespace, item_key, error = %e, "cache lookup failed");
                return None;
            }
        };

        // TODO: surface undecodable records as corruption instead of a miss,
        // once there is a repair path for them.
        match ResultDescriptor::decode(&raw) {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                warn!(namespace, item_key, error = %e, "unreadable cache record, treating as not found");
                None
            }
        }
    }

    fn store(
        &self,
        namespace: &str,
        item_key: &str,
        descriptor: &ResultDescriptor,
    ) -> Result<(), CacheError> {
        let encoded = descriptor.encode()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO dispatched (namespace, item_key, descriptor, stored_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (namespace, item_key) DO UPDATE SET
                     descriptor = excluded.descriptor,
                     stored_at = excluded.stored_at",
                params![namespace, item_key, encoded, chrono::Utc::now().timestamp()],
            )?;
            Ok(())
        })
    }

    fn close(&self) -> Result<(), CacheError> {
        let mut guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| CacheError::Sqlite(e))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
