//! In-memory storage implementation.

use async_trait::async_trait;
use chrono::Utc;
use marketdata_core::{Payload, Result, Storage, StorageClassification};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::record::StoredRecord;

/// Simple in-memory storage for testing and development.
///
/// Records are kept in a `RwLock`-protected `HashMap` and are lost when the
/// storage is dropped. Payloads are cloned on read and write.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    records: RwLock<HashMap<String, StoredRecord>>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record stored under `key`, expired or not.
    pub async fn get(&self, key: &str) -> Option<StoredRecord> {
        self.records.read().await.get(key).cloned()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns true if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Keys of every stored record, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.records.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drops records whose TTL hint has elapsed, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        let removed = before - records.len();
        debug!(removed, "Purged expired records");
        removed
    }

    /// Removes everything.
    pub async fn clear(&self) {
        self.records.write().await.clear();
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    #[instrument(skip(self, data), fields(key = %key, classification = classification.as_str()))]
    async fn store(
        &self,
        key: &str,
        data: &Payload,
        classification: StorageClassification,
        ttl_hint: Duration,
    ) -> Result<()> {
        let record = StoredRecord {
            key: key.to_string(),
            classification,
            data: data.clone(),
            ttl: ttl_hint,
            stored_at: Utc::now(),
        };
        self.records.write().await.insert(key.to_string(), record);
        debug!("Stored record");
        Ok(())
    }
}
