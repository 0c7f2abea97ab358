//! SQLite-backed key/value store with per-record expiration.
//!
//! All durable state lives here, spread over three logical collections
//! (`phase_data`, `products_cache`, `user_recommended_products`) plus the
//! short-lived `resolve_leases` collection used for single-flight guards.
//! Records are JSON values keyed by `(collection, key)`.
//!
//! Expiration is lazy: `get` treats a past-`expires_at` record as absent
//! and eagerly deletes it on the way out. `purge_expired` does the bulk
//! sweep.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::errors::StoreError;

/// Async-safe handle to the store.
///
/// Wraps `Store` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous
/// SQLite I/O from tying up async worker threads.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<Store>>,
}

impl StoreHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Store) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|_| StoreError::TaskPanicked)?
    }
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER,
                PRIMARY KEY (collection, key)
            );

            CREATE INDEX IF NOT EXISTS idx_records_expiry
                ON records(collection, expires_at)
                WHERE expires_at IS NOT NULL;
            ",
        )?;
        Ok(())
    }

    fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn expiry_for(ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|ttl| Self::now_millis() + ttl.as_millis() as i64)
    }

    /// Upsert a record. With a `ttl`, the record becomes invisible to
    /// reads after `now + ttl`; without one it never expires.
    pub fn put(
        &self,
        collection: &str,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.put_record(collection, key, value, Self::expiry_for(ttl))
    }

    fn put_record(
        &self,
        collection: &str,
        key: &str,
        value: &Value,
        expires_at: Option<i64>,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO records (collection, key, value, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (collection, key) DO UPDATE SET
                 value = excluded.value,
                 created_at = excluded.created_at,
                 expires_at = excluded.expires_at",
            params![
                collection,
                key,
                value.to_string(),
                Self::now_millis(),
                expires_at
            ],
        )?;
        Ok(())
    }

    /// Insert only if no live record exists for the key. Returns whether
    /// the insert won. An expired leftover does not block acquisition.
    pub fn put_if_absent(
        &self,
        collection: &str,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let now = Self::now_millis();
        self.conn.execute(
            "DELETE FROM records
             WHERE collection = ?1 AND key = ?2
               AND expires_at IS NOT NULL AND expires_at <= ?3",
            params![collection, key, now],
        )?;
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO records (collection, key, value, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                collection,
                key,
                value.to_string(),
                now,
                Self::expiry_for(ttl)
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Fetch a record, treating an expired one as absent. Expired rows
    /// encountered here are deleted eagerly.
    pub fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let row: Option<(String, Option<i64>)> = self
            .conn
            .query_row(
                "SELECT value, expires_at FROM records WHERE collection = ?1 AND key = ?2",
                params![collection, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((raw, expires_at)) = row else {
            return Ok(None);
        };

        if let Some(expiry) = expires_at {
            if expiry <= Self::now_millis() {
                self.delete(collection, key)?;
                return Ok(None);
            }
        }

        let value =
            serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(Some(value))
    }

    /// Remove a record. Returns true iff something was deleted.
    pub fn delete(&self, collection: &str, key: &str) -> Result<bool, StoreError> {
        let deleted = self.conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND key = ?2",
            params![collection, key],
        )?;
        Ok(deleted > 0)
    }

    /// Non-expired keys in a collection, optionally restricted to a key
    /// prefix. Used for session enumeration and provenance listings.
    pub fn scan_keys(
        &self,
        collection: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<String>, StoreError> {
        let now = Self::now_millis();
        let pattern = prefix.map(|p| format!("{}%", escape_like(p)));

        let mut stmt = self.conn.prepare(
            "SELECT key FROM records
             WHERE collection = ?1
               AND (expires_at IS NULL OR expires_at > ?2)
               AND (?3 IS NULL OR key LIKE ?3 ESCAPE '\\')
             ORDER BY key",
        )?;
        let keys = stmt
            .query_map(params![collection, now, pattern], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    /// Count non-expired records, optionally only those created after the
    /// given instant.
    pub fn count(
        &self,
        collection: &str,
        newer_than: Option<DateTime<Utc>>,
    ) -> Result<u64, StoreError> {
        let now = Self::now_millis();
        let since = newer_than.map(|t| t.timestamp_millis());
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM records
             WHERE collection = ?1
               AND (expires_at IS NULL OR expires_at > ?2)
               AND (?3 IS NULL OR created_at > ?3)",
            params![collection, now, since],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Delete every expired record in a collection, returning the deleted
    /// keys. Idempotent and safe to run concurrently with normal traffic.
    pub fn purge_expired(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        let now = Self::now_millis();
        let mut stmt = self.conn.prepare(
            "DELETE FROM records
             WHERE collection = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2
             RETURNING key",
        )?;
        let keys = stmt
            .query_map(params![collection, now], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}

/// Escape LIKE wildcards so a prefix is matched literally.
fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
