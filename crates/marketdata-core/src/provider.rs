//! Collaborator traits consumed by the cache and query engine.
//!
//! This module defines the boundaries the engine talks to:
//!
//! - [`Receiver`] - Fetches live data for one symbol from an upstream provider
//! - [`Storage`] - Best-effort persistence of freshly fetched data
//! - [`MarketStatusProvider`] - Live trading/holiday state per market

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use crate::{
    error::Result,
    types::{FetchOptions, Market, MarketStatus, Payload, StorageClassification, Symbol},
};

/// Upstream data receiver.
///
/// Implementations wrap a provider SDK and perform the actual network call.
/// Any error returned is treated by callers as a per-symbol failure.
#[async_trait]
pub trait Receiver: Send + Sync + Debug {
    /// Returns the name of this receiver (e.g., "longport").
    fn name(&self) -> &str;

    /// Fetches live data for exactly one symbol.
    async fn fetch(&self, symbol: &Symbol, options: &FetchOptions) -> Result<Payload>;
}

/// Persistent storage for fetched data.
///
/// Writes are best-effort: callers log failures and never wait on them for
/// correctness.
#[async_trait]
pub trait Storage: Send + Sync + Debug {
    /// Stores `data` under `key` with a classification and a TTL hint.
    async fn store(
        &self,
        key: &str,
        data: &Payload,
        classification: StorageClassification,
        ttl_hint: Duration,
    ) -> Result<()>;
}

/// Source of live market trading state.
#[async_trait]
pub trait MarketStatusProvider: Send + Sync + Debug {
    /// Returns the current status of one market.
    async fn get_status(&self, market: Market) -> Result<MarketStatus>;

    /// Returns the current status of several markets.
    ///
    /// Default implementation calls `get_status` for each market and skips
    /// markets whose lookup fails.
    async fn get_batch_status(&self, markets: &[Market]) -> Result<HashMap<Market, MarketStatus>> {
        let mut statuses = HashMap::with_capacity(markets.len());
        for market in markets {
            match self.get_status(*market).await {
                Ok(status) => {
                    statuses.insert(*market, status);
                }
                Err(e) => {
                    tracing::warn!(market = %market, error = %e, "Market status lookup failed");
                }
            }
        }
        Ok(statuses)
    }
}

/// Market-status provider that answers from a fixed table.
///
/// Markets missing from the table are reported as an error, which exercises
/// the resolver's fallback path.
#[derive(Debug, Clone, Default)]
pub struct StaticMarketStatus {
    statuses: HashMap<Market, MarketStatus>,
}

impl StaticMarketStatus {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the status reported for a market.
    #[must_use]
    pub fn with_status(mut self, market: Market, status: MarketStatus) -> Self {
        self.statuses.insert(market, status);
        self
    }

    /// Reports the same status for every known market.
    #[must_use]
    pub fn uniform(status: MarketStatus) -> Self {
        Self {
            statuses: Market::ALL.iter().map(|m| (*m, status)).collect(),
        }
    }
}

#[async_trait]
impl MarketStatusProvider for StaticMarketStatus {
    async fn get_status(&self, market: Market) -> Result<MarketStatus> {
        self.statuses
            .get(&market)
            .copied()
            .ok_or_else(|| crate::error::DataError::NotSupported(format!("no status for {market}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_status_batch_skips_unknown() {
        let provider = StaticMarketStatus::new().with_status(Market::Us, MarketStatus::trading());

        let statuses = provider
            .get_batch_status(&[Market::Us, Market::Hk])
            .await
            .unwrap();

        assert_eq!(statuses.len(), 1);
        assert!(statuses[&Market::Us].is_trading());
        assert!(provider.get_status(Market::Hk).await.is_err());
    }

    #[tokio::test]
    async fn test_static_status_uniform() {
        let provider = StaticMarketStatus::uniform(MarketStatus::holiday());
        for market in Market::ALL {
            assert!(provider.get_status(market).await.unwrap().is_holiday);
        }
    }
}
