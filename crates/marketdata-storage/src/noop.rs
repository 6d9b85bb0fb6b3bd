//! No-op storage implementation.

use async_trait::async_trait;
use marketdata_core::{Payload, Result, Storage, StorageClassification};
use std::time::Duration;
use tracing::trace;

/// A storage that doesn't keep anything.
///
/// Every `store` call returns `Ok(())`. Useful for deployments without
/// persistence or for testing the query path in isolation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStorage;

impl NoopStorage {
    /// Create a new no-op storage.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Storage for NoopStorage {
    async fn store(
        &self,
        key: &str,
        _data: &Payload,
        _classification: StorageClassification,
        _ttl_hint: Duration,
    ) -> Result<()> {
        trace!(key, "NoopStorage: store called, doing nothing");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_noop_storage_store_succeeds() {
        let storage = NoopStorage::new();
        let result = storage
            .store(
                "longport:get-stock-quote:AAPL",
                &json!({ "last": 1.0 }),
                StorageClassification::StockQuote,
                Duration::from_secs(60),
            )
            .await;
        assert!(result.is_ok());
    }
}
