//! SQLite-backed storage implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marketdata_core::{DataError, Payload, Result, Storage, StorageClassification};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::record::StoredRecord;

/// SQLite-backed storage for fetched payloads.
///
/// Stores one row per key, providing persistence across restarts. Payloads are
/// kept as JSON text.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Create a new SQLite storage at the given path.
    ///
    /// # Arguments
    /// * `path` - Path to the SQLite database file
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or schema creation fails.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| DataError::Storage(e.to_string()))?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    /// Create an in-memory SQLite storage.
    ///
    /// Useful for testing; data is lost when the storage is dropped.
    ///
    /// # Errors
    /// Returns an error if schema creation fails.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| DataError::Storage(e.to_string()))?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| DataError::Storage(e.to_string()))
    }

    /// Initialize the database schema.
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS stored_data (
                key TEXT PRIMARY KEY,
                classification TEXT NOT NULL,
                data_json TEXT NOT NULL,
                ttl_ms INTEGER NOT NULL,
                expires_at_ms INTEGER,
                stored_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| DataError::Storage(e.to_string()))?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_stored_data_classification
             ON stored_data(classification)",
            [],
        )
        .map_err(|e| DataError::Storage(e.to_string()))?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_stored_data_expires_at
             ON stored_data(expires_at_ms)",
            [],
        )
        .map_err(|e| DataError::Storage(e.to_string()))?;

        debug!("SQLite storage schema initialized");
        Ok(())
    }

    /// Returns the record stored under `key`, expired or not.
    ///
    /// # Errors
    /// Returns an error if the query fails or a stored row cannot be decoded.
    #[instrument(skip(self))]
    pub fn get(&self, key: &str) -> Result<Option<StoredRecord>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT classification, data_json, ttl_ms, stored_at
                 FROM stored_data WHERE key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| DataError::Storage(e.to_string()))?;

        let Some((classification, data_json, ttl_ms, stored_at)) = row else {
            debug!("No stored record found");
            return Ok(None);
        };

        let data: Payload =
            serde_json::from_str(&data_json).map_err(|e| DataError::Storage(e.to_string()))?;
        let stored_at = DateTime::parse_from_rfc3339(&stored_at)
            .map_err(|e| DataError::Storage(e.to_string()))?
            .with_timezone(&Utc);

        Ok(Some(StoredRecord {
            key: key.to_string(),
            classification: StorageClassification::from_stored(&classification),
            data,
            ttl: Duration::from_millis(u64::try_from(ttl_ms).unwrap_or(0)),
            stored_at,
        }))
    }

    /// Number of stored rows.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn len(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM stored_data", [], |row| row.get(0))
            .map_err(|e| DataError::Storage(e.to_string()))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Returns true if nothing is stored.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Deletes rows whose TTL hint elapsed before `now`, returning how many were removed.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    #[instrument(skip(self))]
    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM stored_data
                 WHERE expires_at_ms IS NOT NULL AND expires_at_ms < ?1",
                params![now.timestamp_millis()],
            )
            .map_err(|e| DataError::Storage(e.to_string()))?;
        debug!("Purged {} expired rows", deleted);
        Ok(deleted)
    }

    /// Deletes rows whose TTL hint has elapsed.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub fn purge_expired(&self) -> Result<usize> {
        self.purge_expired_at(Utc::now())
    }

    /// Deletes everything.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub fn clear(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM stored_data", [])
            .map_err(|e| DataError::Storage(e.to_string()))?;
        debug!("Cleared all stored rows");
        Ok(())
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    #[instrument(skip(self, data), fields(key = %key, classification = classification.as_str()))]
    async fn store(
        &self,
        key: &str,
        data: &Payload,
        classification: StorageClassification,
        ttl_hint: Duration,
    ) -> Result<()> {
        let data_json = serde_json::to_string(data).map_err(|e| DataError::Storage(e.to_string()))?;
        let stored_at = Utc::now();
        let ttl_ms = i64::try_from(ttl_hint.as_millis()).unwrap_or(i64::MAX);
        let expires_at_ms =
            (!ttl_hint.is_zero()).then(|| stored_at.timestamp_millis().saturating_add(ttl_ms));

        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO stored_data
             (key, classification, data_json, ttl_ms, expires_at_ms, stored_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                key,
                classification.as_str(),
                data_json,
                ttl_ms,
                expires_at_ms,
                stored_at.to_rfc3339()
            ],
        )
        .map_err(|e| DataError::Storage(e.to_string()))?;

        debug!("Stored {} bytes", data_json.len());
        Ok(())
    }
}
