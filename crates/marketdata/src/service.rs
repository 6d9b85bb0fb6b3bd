//! Service wiring for the market-data engine.

use std::fmt;
use std::sync::Arc;

use marketdata_cache::{CacheStats, InvalidationMessage, ShutdownReport, SmartCacheOrchestrator};
use marketdata_core::{
    Clock, DataError, EngineConfig, MarketStatusProvider, MetricsSink, NoopMetricsSink, Receiver,
    Result, Storage, SystemClock,
};
use marketdata_query::{
    MemoryPressureMonitor, MemorySampler, ProcMemorySampler, QueryExecutionResult, QueryPipeline,
    QueryRequest,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::calendar::TradingCalendar;

/// Builder for [`MarketDataService`].
///
/// Only the receiver is required. Unset collaborators default to:
///
/// - market status: a [`TradingCalendar`] on the builder's clock
/// - memory sampling: [`ProcMemorySampler`]
/// - storage: none
/// - metrics: [`NoopMetricsSink`]
/// - clock: [`SystemClock`]
pub struct MarketDataServiceBuilder {
    config: EngineConfig,
    receiver: Option<Arc<dyn Receiver>>,
    storage: Option<Arc<dyn Storage>>,
    market_status: Option<Arc<dyn MarketStatusProvider>>,
    memory_sampler: Option<Arc<dyn MemorySampler>>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for MarketDataServiceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarketDataServiceBuilder")
            .field("config", &self.config)
            .field("receiver", &self.receiver.as_ref().map(|r| r.name()))
            .field("storage", &self.storage.as_ref().map(|_| "configured"))
            .field("market_status", &self.market_status)
            .field(
                "memory_sampler",
                &self.memory_sampler.as_ref().map(|_| "configured"),
            )
            .field("metrics", &self.metrics)
            .field("clock", &self.clock)
            .finish()
    }
}

impl Default for MarketDataServiceBuilder {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl MarketDataServiceBuilder {
    /// Starts a builder from `config`.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            receiver: None,
            storage: None,
            market_status: None,
            memory_sampler: None,
            metrics: Arc::new(NoopMetricsSink),
            clock: Arc::new(SystemClock),
        }
    }

    /// Starts a builder from [`EngineConfig::from_env`].
    ///
    /// # Errors
    /// Returns [`DataError::InvalidConfig`] if the environment is malformed.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(EngineConfig::from_env()?))
    }

    /// Sets the upstream receiver.
    #[must_use]
    pub fn with_receiver(mut self, receiver: Arc<dyn Receiver>) -> Self {
        debug!(receiver = receiver.name(), "Registering receiver");
        self.receiver = Some(receiver);
        self
    }

    /// Persists fresh fetches to `storage`.
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Replaces the trading calendar with `provider`.
    #[must_use]
    pub fn with_market_status(mut self, provider: Arc<dyn MarketStatusProvider>) -> Self {
        self.market_status = Some(provider);
        self
    }

    /// Samples memory usage from `sampler` instead of `/proc/meminfo`.
    #[must_use]
    pub fn with_memory_sampler(mut self, sampler: Arc<dyn MemorySampler>) -> Self {
        self.memory_sampler = Some(sampler);
        self
    }

    /// Emits cache and query metrics to `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Sets the clock used for cache expiry and the default calendar.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validates the configuration and assembles the service.
    ///
    /// The returned service is not started; call [`MarketDataService::start`].
    ///
    /// # Errors
    /// Returns [`DataError::InvalidConfig`] without a receiver or if the
    /// configuration fails validation.
    pub fn build(self) -> Result<MarketDataService> {
        let receiver = self.receiver.ok_or_else(|| {
            DataError::InvalidConfig("no receiver registered".to_string())
        })?;
        self.config.validate()?;

        let cache = SmartCacheOrchestrator::new(
            self.config.cache.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.metrics),
        )?;

        let market_status: Arc<dyn MarketStatusProvider> = match self.market_status {
            Some(provider) => provider,
            None => Arc::new(TradingCalendar::with_clock(Arc::clone(&self.clock))),
        };
        let sampler: Arc<dyn MemorySampler> = match self.memory_sampler {
            Some(sampler) => sampler,
            None => Arc::new(ProcMemorySampler::new()),
        };
        let monitor = MemoryPressureMonitor::new(self.config.memory.clone(), sampler)?;

        let mut pipeline = QueryPipeline::new(self.config.query.clone(), cache.clone(), receiver)?
            .with_market_status(market_status)
            .with_memory_monitor(monitor)
            .with_metrics(self.metrics);
        if let Some(storage) = self.storage {
            pipeline = pipeline.with_storage(storage);
        }

        Ok(MarketDataService {
            config: self.config,
            cache,
            pipeline,
        })
    }
}

/// The assembled engine: one smart cache shared by one query pipeline.
///
/// Cloning is cheap and clones share the cache.
#[derive(Debug, Clone)]
pub struct MarketDataService {
    config: EngineConfig,
    cache: SmartCacheOrchestrator,
    pipeline: QueryPipeline,
}

impl MarketDataService {
    /// Starts a [`MarketDataServiceBuilder`] with the default configuration.
    #[must_use]
    pub fn builder() -> MarketDataServiceBuilder {
        MarketDataServiceBuilder::default()
    }

    /// Starts the cache's background timers.
    ///
    /// # Errors
    /// Returns [`DataError::ShuttingDown`] after [`shutdown`](Self::shutdown).
    pub fn start(&self) -> Result<()> {
        self.cache.start()?;
        info!(
            max_entries = self.config.cache.max_entries,
            max_concurrent_updates = self.config.cache.max_concurrent_updates,
            memory_monitor = self.config.memory.enabled,
            "Market data service started"
        );
        Ok(())
    }

    /// Applies cache invalidations pushed on `rx`.
    ///
    /// # Errors
    /// Returns [`DataError::ShuttingDown`] after [`shutdown`](Self::shutdown).
    pub fn watch_invalidations(&self, rx: mpsc::Receiver<InvalidationMessage>) -> Result<()> {
        self.cache.watch_invalidations(rx)
    }

    /// Runs a batched symbol query.
    pub async fn query(&self, request: QueryRequest) -> QueryExecutionResult {
        self.pipeline.execute_symbol_query(request).await
    }

    /// Current cache counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// The configuration the service was built with.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The shared smart cache.
    #[must_use]
    pub const fn cache(&self) -> &SmartCacheOrchestrator {
        &self.cache
    }

    /// The query pipeline.
    #[must_use]
    pub const fn pipeline(&self) -> &QueryPipeline {
        &self.pipeline
    }

    /// Stops timers and drains background refreshes within the configured
    /// grace period.
    pub async fn shutdown(&self) -> ShutdownReport {
        let report = self.cache.shutdown().await;
        info!(?report, "Market data service stopped");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use marketdata_core::{
        CacheStrategy, FetchOptions, ManualClock, Market, MarketStatus, Payload,
        StaticMarketStatus, Symbol,
    };
    use marketdata_query::{MemorySample, QueryType};
    use marketdata_storage::InMemoryStorage;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct EchoReceiver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Receiver for EchoReceiver {
        fn name(&self) -> &str {
            "echo"
        }

        async fn fetch(&self, symbol: &Symbol, _options: &FetchOptions) -> Result<Payload> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "symbol": symbol.as_str(), "last": 1.0 }))
        }
    }

    #[derive(Debug)]
    struct FixedUsage(f64);

    impl MemorySampler for FixedUsage {
        fn sample(&self) -> Result<MemorySample> {
            Ok(MemorySample {
                used_bytes: (self.0 * 1000.0) as u64,
                total_bytes: 1000,
            })
        }
    }

    fn builder(receiver: Arc<EchoReceiver>) -> MarketDataServiceBuilder {
        MarketDataService::builder()
            .with_receiver(receiver)
            .with_clock(Arc::new(ManualClock::new(1_700_000_000_000)))
            .with_memory_sampler(Arc::new(FixedUsage(0.10)))
    }

    #[test]
    fn test_build_requires_receiver() {
        let err = MarketDataService::builder().build().unwrap_err();
        assert!(matches!(err, DataError::InvalidConfig(_)));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.query.market_chunk_size = 0;
        let err = MarketDataServiceBuilder::new(config)
            .with_receiver(Arc::new(EchoReceiver::default()))
            .build()
            .unwrap_err();
        assert!(matches!(err, DataError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_cold_then_warm_query() {
        let receiver = Arc::new(EchoReceiver::default());
        let storage = Arc::new(InMemoryStorage::new());
        let service = builder(receiver.clone())
            .with_storage(storage.clone())
            .build()
            .unwrap();
        service.start().unwrap();

        let request = QueryRequest::new(["600000", "AAPL", "0001.HK"])
            .with_strategy(CacheStrategy::WeakTimeliness);

        let cold = service.query(request.clone()).await;
        assert_eq!(cold.results.len(), 3);
        assert!(cold.errors.is_empty());
        assert_eq!(cold.data_sources.realtime.hits, 3);
        assert_eq!(cold.data_sources.cache.hits, 0);
        assert!(!cold.cache_used);

        let warm = service.query(request).await;
        assert_eq!(warm.data_sources.cache.hits, 3);
        assert!(warm.cache_used);
        assert_eq!(receiver.calls.load(Ordering::SeqCst), 3);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(storage.len().await, 3);

        let stats = service.stats();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 3);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_market_status_feeds_market_aware_ttl() {
        let receiver = Arc::new(EchoReceiver::default());
        let service = builder(receiver)
            .with_market_status(Arc::new(
                StaticMarketStatus::new().with_status(Market::Us, MarketStatus::closed()),
            ))
            .build()
            .unwrap();

        let result = service
            .query(QueryRequest::new(["AAPL"]).with_strategy(CacheStrategy::MarketAware))
            .await;
        assert!(result.errors.is_empty());

        let entry = service
            .cache()
            .entry("smart_cache:auto:get-stock-quote:AAPL")
            .unwrap();
        assert_eq!(entry.ttl, service.config().cache.market_closed_ttl);
    }

    #[tokio::test]
    async fn test_memory_pressure_defers_queries() {
        let receiver = Arc::new(EchoReceiver::default());
        let service = MarketDataServiceBuilder::new(EngineConfig::default())
        .with_receiver(receiver.clone())
        .with_clock(Arc::new(ManualClock::new(1_700_000_000_000)))
        .with_memory_sampler(Arc::new(FixedUsage(0.99)))
        .build()
        .unwrap();

        let result = service
            .query(QueryRequest::new(["AAPL", "MSFT"]).with_query_type(QueryType::Realtime))
            .await;
        assert!(result.results.is_empty());
        assert_eq!(result.errors.len(), 2);
        assert_eq!(receiver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_blocks_restart() {
        let service = builder(Arc::new(EchoReceiver::default())).build().unwrap();
        service.start().unwrap();

        let report = service.shutdown().await;
        assert_eq!(report.abandoned, 0);
        assert!(service.cache().is_shutting_down());
        assert!(matches!(service.start(), Err(DataError::ShuttingDown)));

        let (_tx, rx) = mpsc::channel(1);
        assert!(matches!(
            service.watch_invalidations(rx),
            Err(DataError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_invalidation_through_service() {
        let receiver = Arc::new(EchoReceiver::default());
        let service = builder(receiver.clone()).build().unwrap();
        let (tx, rx) = mpsc::channel(4);
        service.watch_invalidations(rx).unwrap();

        let request = QueryRequest::new(["AAPL"]).with_strategy(CacheStrategy::WeakTimeliness);
        service.query(request.clone()).await;
        tx.send(InvalidationMessage::Symbol(Symbol::new("AAPL")))
            .await
            .unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        service.query(request).await;

        assert_eq!(receiver.calls.load(Ordering::SeqCst), 2);
        service.shutdown().await;
    }
}
