//! Batched query pipeline.
//!
//! [`QueryPipeline::execute_symbol_query`] turns a list of raw symbols into one
//! [`QueryExecutionResult`]:
//!
//! 1. validate and dedupe symbols
//! 2. group them by market
//! 3. gate the batch on memory pressure
//! 4. look up market status when the strategy needs it
//! 5. shard each market into chunks and receiver batches, each level under its
//!    own timeout, and resolve every symbol through the smart cache
//! 6. reassemble results in request order, then project and page them
//!
//! Symbol-level failures are data: they end up in
//! [`QueryExecutionResult::errors`] and never abort sibling work. A timed-out
//! shard is dropped, which cancels its pending fetches.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use marketdata_cache::{CacheRequest, CacheResult, SmartCacheOrchestrator, data_flow};
use marketdata_core::{
    CacheStrategy, DataError, FetchOptions, Market, MarketStatus, MarketStatusProvider,
    MetricsEvent, MetricsSink, NoopMetricsSink, Payload, QueryConfig, Receiver, Result, Storage,
    StorageClassification, Symbol,
};
use tokio::time::{Instant, timeout};
use tracing::{Span, debug, field, info, instrument, warn};
use uuid::Uuid;

use crate::{
    memory::{MemoryPressureMonitor, PressureLevel, Recommendation},
    projection::project,
    shard::{self, QueryBatchContext},
    types::{
        DataSource, DataSources, Pagination, QueryErrorInfo, QueryExecutionResult, QueryRequest,
        QueryType, SymbolDataResult,
    },
};

/// A validated symbol and its position in the request.
#[derive(Debug, Clone)]
struct Slot {
    index: usize,
    symbol: Symbol,
}

#[derive(Debug)]
enum Outcome {
    Cache(Payload),
    Realtime(Payload),
    FetchFailed(String),
    TimedOut(String),
}

#[derive(Debug)]
struct SymbolOutcome {
    index: usize,
    symbol: Symbol,
    outcome: Outcome,
}

/// Request-scoped settings shared by every shard of one query.
#[derive(Debug)]
struct QueryScope {
    query_id: String,
    receiver_type: String,
    provider: Option<String>,
    strategy: CacheStrategy,
    market_status: HashMap<Market, MarketStatus>,
    volatility: Option<f64>,
    include_fields: Vec<String>,
    exclude_fields: Vec<String>,
}

/// Sharded, memory-aware batch query executor.
#[derive(Debug, Clone)]
pub struct QueryPipeline {
    config: QueryConfig,
    cache: SmartCacheOrchestrator,
    receiver: Arc<dyn Receiver>,
    storage: Option<Arc<dyn Storage>>,
    market_status: Option<Arc<dyn MarketStatusProvider>>,
    memory: Option<MemoryPressureMonitor>,
    metrics: Arc<dyn MetricsSink>,
}

impl QueryPipeline {
    /// Creates a pipeline with no storage, no market-status source and no memory gate.
    ///
    /// # Errors
    /// Returns [`DataError::InvalidConfig`] for zero chunk sizes, zero timeouts
    /// or badly nested timeouts.
    pub fn new(
        config: QueryConfig,
        cache: SmartCacheOrchestrator,
        receiver: Arc<dyn Receiver>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cache,
            receiver,
            storage: None,
            market_status: None,
            memory: None,
            metrics: Arc::new(NoopMetricsSink),
        })
    }

    /// Persists freshly fetched data to `storage`.
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Looks up market status from `provider` for market-aware queries.
    #[must_use]
    pub fn with_market_status(mut self, provider: Arc<dyn MarketStatusProvider>) -> Self {
        self.market_status = Some(provider);
        self
    }

    /// Gates every query on `monitor`.
    #[must_use]
    pub fn with_memory_monitor(mut self, monitor: MemoryPressureMonitor) -> Self {
        self.memory = Some(monitor);
        self
    }

    /// Emits query metrics to `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The cache this pipeline resolves symbols through.
    #[must_use]
    pub const fn cache(&self) -> &SmartCacheOrchestrator {
        &self.cache
    }

    /// Runs one batched query. Never fails; per-symbol problems are reported
    /// in the result.
    #[instrument(skip(self, request), fields(symbols = request.symbols.len(), query_id = field::Empty))]
    pub async fn execute_symbol_query(&self, request: QueryRequest) -> QueryExecutionResult {
        let started = Instant::now();
        let query_id = Uuid::new_v4().to_string();
        Span::current().record("query_id", query_id.as_str());

        let (valid, mut errors) = validate(&request.symbols);
        let validated = valid.len();
        let mut by_market = group_by_market(valid, request.market);

        if let Some(monitor) = &self.memory {
            let check = monitor.check_before_batch(validated);
            if check.pressure_level != PressureLevel::Normal {
                self.metrics.emit(MetricsEvent::MemoryPressure {
                    usage_percent: check.current_usage_percent,
                    deferred: !check.can_process,
                });
            }
            match check.recommendation {
                Recommendation::Proceed => {}
                Recommendation::Defer => {
                    let reason = DataError::MemoryPressure(format!(
                        "memory usage critical ({:.1}%), query deferred",
                        check.current_usage_percent
                    ))
                    .to_string();
                    for slot in by_market.into_values().flatten() {
                        errors.push((slot.index, QueryErrorInfo::new(slot.symbol.as_str(), &reason)));
                    }
                    return self.assemble(&request, query_id, validated, Vec::new(), errors, started);
                }
                Recommendation::ReduceBatch => {
                    let keep = check.suggested_batch_size.unwrap_or(validated);
                    let reason = DataError::MemoryPressure(format!(
                        "deferred under memory pressure ({:.1}%)",
                        check.current_usage_percent
                    ))
                    .to_string();
                    by_market = reduce(by_market, keep, &reason, &mut errors);
                }
            }
        }

        let strategy = request.strategy.unwrap_or(match request.query_type {
            QueryType::BySymbols => self.config.default_strategy,
            QueryType::Realtime => CacheStrategy::StrongTimeliness,
        });
        let markets: Vec<Market> = by_market.keys().copied().collect();
        let scope = QueryScope {
            market_status: self.lookup_market_status(strategy, &markets).await,
            query_id: query_id.clone(),
            receiver_type: request
                .receiver_type
                .clone()
                .unwrap_or_else(|| self.config.default_receiver_type.clone()),
            provider: request.provider.clone(),
            strategy,
            volatility: request.volatility,
            include_fields: request.options.include_fields.clone(),
            exclude_fields: request.options.exclude_fields.clone(),
        };

        // Each market's slots move into its shard future and are dropped with it.
        let outcomes: Vec<SymbolOutcome> = if self.config.sequential_markets {
            let mut outcomes = Vec::new();
            for (market, slots) in by_market {
                outcomes.extend(self.run_market(&scope, market, slots).await);
            }
            outcomes
        } else {
            join_all(
                by_market
                    .into_iter()
                    .map(|(market, slots)| self.run_market(&scope, market, slots)),
            )
            .await
            .into_iter()
            .flatten()
            .collect()
        };

        self.assemble(&request, query_id, validated, outcomes, errors, started)
    }

    async fn lookup_market_status(
        &self,
        strategy: CacheStrategy,
        markets: &[Market],
    ) -> HashMap<Market, MarketStatus> {
        let Some(provider) = self.market_status.as_ref() else {
            return HashMap::new();
        };
        if !strategy.needs_market_status() || markets.is_empty() {
            return HashMap::new();
        }
        match timeout(
            self.config.market_status_timeout,
            provider.get_batch_status(markets),
        )
        .await
        {
            Ok(Ok(statuses)) => statuses,
            Ok(Err(e)) => {
                warn!(error = %e, "Market status lookup failed, using fallback TTLs");
                HashMap::new()
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.market_status_timeout.as_millis() as u64,
                    "Market status lookup timed out, using fallback TTLs"
                );
                HashMap::new()
            }
        }
    }

    async fn run_market(
        &self,
        scope: &QueryScope,
        market: Market,
        slots: Vec<Slot>,
    ) -> Vec<SymbolOutcome> {
        let ctx = QueryBatchContext::market(&scope.query_id, market);
        debug!(%ctx, symbols = slots.len(), "Running market shard");

        let chunks = shard::plan(
            slots.len(),
            self.config.market_chunk_size,
            self.config.receiver_batch_size,
        );
        let work = join_all(
            chunks
                .into_iter()
                .enumerate()
                .map(|(i, batches)| self.run_chunk(scope, ctx.chunk(i), &slots, batches)),
        );

        match timeout(self.config.market_timeout, work).await {
            Ok(outcomes) => outcomes.into_iter().flatten().collect(),
            Err(_) => self.timed_out("market shard", self.config.market_timeout, &ctx, &slots),
        }
    }

    async fn run_chunk(
        &self,
        scope: &QueryScope,
        ctx: QueryBatchContext,
        slots: &[Slot],
        batches: Vec<Range<usize>>,
    ) -> Vec<SymbolOutcome> {
        let span = shard::span(&batches);
        let work = join_all(
            batches.into_iter().enumerate().map(|(i, range)| {
                self.run_receiver_batch(scope, ctx.receiver_batch(i), &slots[range])
            }),
        );

        match timeout(self.config.chunk_timeout, work).await {
            Ok(outcomes) => outcomes.into_iter().flatten().collect(),
            Err(_) => self.timed_out(
                "market chunk",
                self.config.chunk_timeout,
                &ctx,
                &slots[span],
            ),
        }
    }

    async fn run_receiver_batch(
        &self,
        scope: &QueryScope,
        ctx: QueryBatchContext,
        batch: &[Slot],
    ) -> Vec<SymbolOutcome> {
        match timeout(
            self.config.receiver_batch_timeout,
            self.fetch_batch(scope, &ctx, batch),
        )
        .await
        {
            Ok(outcomes) => outcomes,
            Err(_) => self.timed_out(
                "receiver batch",
                self.config.receiver_batch_timeout,
                &ctx,
                batch,
            ),
        }
    }

    #[instrument(skip(self, scope, ctx, batch), fields(shard = %ctx, symbols = batch.len()))]
    async fn fetch_batch(
        &self,
        scope: &QueryScope,
        ctx: &QueryBatchContext,
        batch: &[Slot],
    ) -> Vec<SymbolOutcome> {
        let requests = batch
            .iter()
            .map(|slot| self.cache_request(scope, ctx.market, &slot.symbol))
            .collect();
        let results = self.cache.batch_get_data_with_smart_cache(requests).await;

        batch
            .iter()
            .zip(results)
            .map(|(slot, result)| self.settle(scope, slot, result))
            .collect()
    }

    fn cache_request(&self, scope: &QueryScope, market: Market, symbol: &Symbol) -> CacheRequest {
        let receiver = Arc::clone(&self.receiver);
        let fetch_symbol = symbol.clone();
        let options = FetchOptions {
            receiver_type: scope.receiver_type.clone(),
            provider: scope.provider.clone(),
            market: Some(market),
            include_fields: scope.include_fields.clone(),
            exclude_fields: scope.exclude_fields.clone(),
        };
        let flow = data_flow(move || {
            let receiver = Arc::clone(&receiver);
            let symbol = fetch_symbol.clone();
            let options = options.clone();
            async move { receiver.fetch(&symbol, &options).await }
        });

        let mut request = CacheRequest::new(vec![symbol.clone()], scope.receiver_type.as_str(), flow)
            .with_query_id(scope.query_id.as_str())
            .with_strategy(scope.strategy)
            .with_market(market)
            .with_market_status(scope.market_status.clone());
        if let Some(provider) = &scope.provider {
            request = request.with_provider(provider.as_str());
        }
        if let Some(volatility) = scope.volatility {
            request = request.with_volatility(volatility);
        }
        request
    }

    fn settle(&self, scope: &QueryScope, slot: &Slot, result: CacheResult) -> SymbolOutcome {
        let outcome = match result {
            CacheResult {
                hit: true,
                data: Some(data),
                ..
            } => Outcome::Cache(data),
            CacheResult {
                data: Some(data),
                key,
                ..
            } => {
                self.persist(scope, &slot.symbol, &key, &data);
                Outcome::Realtime(data)
            }
            CacheResult { error, .. } => Outcome::FetchFailed(
                error.unwrap_or_else(|| "no data returned".to_string()),
            ),
        };
        SymbolOutcome {
            index: slot.index,
            symbol: slot.symbol.clone(),
            outcome,
        }
    }

    /// Hands fresh data to storage without waiting for the write.
    fn persist(&self, scope: &QueryScope, symbol: &Symbol, cache_key: &str, data: &Payload) {
        let Some(storage) = &self.storage else {
            return;
        };
        let storage = Arc::clone(storage);
        let key = format!(
            "{}:{}:{}",
            scope.provider.as_deref().unwrap_or("auto"),
            scope.receiver_type,
            symbol
        );
        let classification = StorageClassification::from_receiver_type(&scope.receiver_type);
        let ttl_hint = self
            .cache
            .entry(cache_key)
            .map_or(Duration::ZERO, |entry| entry.ttl);
        let data = data.clone();

        tokio::spawn(async move {
            if let Err(e) = storage.store(&key, &data, classification, ttl_hint).await {
                warn!(key = %key, error = %e, "Storage write failed");
            }
        });
    }

    fn timed_out(
        &self,
        shard: &str,
        limit: Duration,
        ctx: &QueryBatchContext,
        slots: &[Slot],
    ) -> Vec<SymbolOutcome> {
        warn!(%ctx, shard, symbols = slots.len(), "Shard timed out");
        self.metrics.emit(MetricsEvent::ShardTimedOut {
            market: ctx.market,
            symbols: slots.len(),
        });
        let reason = format!(
            "{}: {shard} timed out ({ctx})",
            DataError::Timeout(limit)
        );
        slots
            .iter()
            .map(|slot| SymbolOutcome {
                index: slot.index,
                symbol: slot.symbol.clone(),
                outcome: Outcome::TimedOut(reason.clone()),
            })
            .collect()
    }

    fn assemble(
        &self,
        request: &QueryRequest,
        query_id: String,
        validated: usize,
        outcomes: Vec<SymbolOutcome>,
        mut errors: Vec<(usize, QueryErrorInfo)>,
        started: Instant,
    ) -> QueryExecutionResult {
        let mut sources = DataSources::default();
        let mut results = Vec::with_capacity(outcomes.len());

        for SymbolOutcome {
            index,
            symbol,
            outcome,
        } in outcomes
        {
            let symbol = symbol.as_str().to_string();
            match outcome {
                Outcome::Cache(data) => {
                    sources.cache.hits += 1;
                    results.push((index, symbol, data, DataSource::Cache));
                }
                Outcome::Realtime(data) => {
                    sources.cache.misses += 1;
                    sources.realtime.hits += 1;
                    results.push((index, symbol, data, DataSource::Realtime));
                }
                Outcome::FetchFailed(reason) => {
                    sources.cache.misses += 1;
                    sources.realtime.misses += 1;
                    errors.push((index, QueryErrorInfo::new(symbol, reason)));
                }
                Outcome::TimedOut(reason) => {
                    sources.realtime.misses += 1;
                    errors.push((index, QueryErrorInfo::new(symbol, reason)));
                }
            }
        }

        results.sort_by_key(|(index, ..)| *index);
        errors.sort_by_key(|(index, _)| *index);

        let total = results.len();
        let pagination = (request.page.is_some() || request.limit.is_some()).then(|| {
            Pagination::new(
                request.page.unwrap_or(1),
                request.limit.unwrap_or(self.config.default_page_limit),
                total,
            )
        });
        let range = pagination.as_ref().map_or(0..total, Pagination::range);

        let results: Vec<SymbolDataResult> = results
            .into_iter()
            .skip(range.start)
            .take(range.len())
            .map(|(_, symbol, data, source)| SymbolDataResult {
                symbol,
                data: project(data, &request.options),
                source,
            })
            .collect();
        let errors: Vec<QueryErrorInfo> = errors.into_iter().map(|(_, e)| e).collect();

        let elapsed = started.elapsed();
        info!(
            query_id = %query_id,
            symbols = validated,
            results = total,
            errors = errors.len(),
            cache_hits = sources.cache.hits,
            realtime_hits = sources.realtime.hits,
            elapsed_ms = elapsed.as_millis() as u64,
            "Query completed"
        );
        self.metrics.emit(MetricsEvent::QueryCompleted {
            query_id: query_id.clone(),
            symbols: validated,
            results: total,
            errors: errors.len(),
            elapsed,
        });

        QueryExecutionResult {
            query_id,
            results,
            cache_used: sources.cache.hits > 0,
            data_sources: sources,
            errors,
            pagination,
        }
    }
}

/// Parses raw symbols, collapsing duplicates to their first occurrence.
fn validate(raw: &[String]) -> (Vec<Slot>, Vec<(usize, QueryErrorInfo)>) {
    let mut seen = HashSet::new();
    let mut valid = Vec::with_capacity(raw.len());
    let mut errors = Vec::new();

    for (index, input) in raw.iter().enumerate() {
        match Symbol::parse(input) {
            Ok(symbol) if seen.insert(symbol.clone()) => valid.push(Slot { index, symbol }),
            Ok(symbol) => debug!(symbol = %symbol, "Dropping duplicate symbol"),
            Err(e) => errors.push((index, QueryErrorInfo::new(input.as_str(), e.to_string()))),
        }
    }
    (valid, errors)
}

fn group_by_market(slots: Vec<Slot>, forced: Option<Market>) -> BTreeMap<Market, Vec<Slot>> {
    let mut by_market: BTreeMap<Market, Vec<Slot>> = BTreeMap::new();
    for slot in slots {
        let market = forced.unwrap_or_else(|| slot.symbol.market());
        by_market.entry(market).or_default().push(slot);
    }
    by_market
}

/// Keeps the first `keep` symbols walking markets in order; the rest fail with `reason`.
fn reduce(
    by_market: BTreeMap<Market, Vec<Slot>>,
    keep: usize,
    reason: &str,
    errors: &mut Vec<(usize, QueryErrorInfo)>,
) -> BTreeMap<Market, Vec<Slot>> {
    let mut remaining = keep;
    by_market
        .into_iter()
        .filter_map(|(market, mut slots)| {
            let kept = slots.len().min(remaining);
            remaining -= kept;
            for slot in slots.split_off(kept) {
                errors.push((slot.index, QueryErrorInfo::new(slot.symbol.as_str(), reason)));
            }
            (!slots.is_empty()).then_some((market, slots))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemorySample, MemorySampler};
    use async_trait::async_trait;
    use marketdata_core::{
        CacheConfig, ChannelMetricsSink, ManualClock, MemoryConfig, StaticMarketStatus,
    };
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct FakeReceiver {
        calls: AtomicUsize,
        failing: HashSet<String>,
        slow: HashMap<String, Duration>,
    }

    impl FakeReceiver {
        fn failing(symbols: impl IntoIterator<Item = String>) -> Self {
            Self {
                failing: symbols.into_iter().collect(),
                ..Default::default()
            }
        }

        fn slow(symbol: &str, delay: Duration) -> Self {
            Self {
                slow: HashMap::from([(symbol.to_string(), delay)]),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Receiver for FakeReceiver {
        fn name(&self) -> &str {
            "fake"
        }

        async fn fetch(&self, symbol: &Symbol, options: &FetchOptions) -> Result<Payload> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.slow.get(symbol.as_str()) {
                tokio::time::sleep(*delay).await;
            }
            if self.failing.contains(symbol.as_str()) {
                return Err(DataError::Network(format!("upstream rejected {symbol}")));
            }
            Ok(json!({
                "symbol": symbol.as_str(),
                "market": options.market.map(|m| m.code()),
                "last": 10.5,
                "volume": 1000,
            }))
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

    #[derive(Debug, Default)]
    struct RecordingStorage {
        keys: Mutex<Vec<(String, StorageClassification)>>,
    }

    #[async_trait]
    impl Storage for RecordingStorage {
        async fn store(
            &self,
            key: &str,
            _data: &Payload,
            classification: StorageClassification,
            _ttl_hint: Duration,
        ) -> Result<()> {
            self.keys
                .lock()
                .unwrap()
                .push((key.to_string(), classification));
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct FailingStorage {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Storage for FailingStorage {
        async fn store(
            &self,
            _key: &str,
            _data: &Payload,
            _classification: StorageClassification,
            _ttl_hint: Duration,
        ) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(DataError::Storage("disk full".into()))
        }
    }

    #[derive(Debug)]
    struct StalledStatus;

    #[async_trait]
    impl MarketStatusProvider for StalledStatus {
        async fn get_status(&self, _market: Market) -> Result<MarketStatus> {
            std::future::pending().await
        }
    }

    fn cache() -> SmartCacheOrchestrator {
        SmartCacheOrchestrator::new(
            CacheConfig::default(),
            Arc::new(ManualClock::new(1_700_000_000_000)),
            Arc::new(NoopMetricsSink),
        )
        .unwrap()
    }

    fn pipeline(config: QueryConfig, receiver: Arc<FakeReceiver>) -> QueryPipeline {
        QueryPipeline::new(config, cache(), receiver).unwrap()
    }

    fn symbols(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i:03}")).collect()
    }

    #[tokio::test]
    async fn test_cold_mixed_market_scenario() {
        let receiver = Arc::new(FakeReceiver::default());
        let pipeline = pipeline(QueryConfig::default(), receiver.clone());

        let result = pipeline
            .execute_symbol_query(
                QueryRequest::new(["600000", "AAPL", "0001.HK"])
                    .with_strategy(CacheStrategy::WeakTimeliness),
            )
            .await;

        assert!(result.errors.is_empty());
        assert_eq!(receiver.calls(), 3);
        assert_eq!(result.data_sources.realtime.hits, 3);
        assert_eq!(result.data_sources.cache.hits, 0);
        assert_eq!(result.data_sources.cache.misses, 3);
        assert!(!result.cache_used);

        let order: Vec<&str> = result.results.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(order, vec!["600000", "AAPL", "0001.HK"]);
        let markets: Vec<&str> = result
            .results
            .iter()
            .map(|r| r.data["market"].as_str().unwrap())
            .collect();
        assert_eq!(markets, vec!["CN", "US", "HK"]);
        assert!(result.results.iter().all(|r| r.source == DataSource::Realtime));
    }

    #[tokio::test]
    async fn test_second_query_is_served_from_cache() {
        let receiver = Arc::new(FakeReceiver::default());
        let pipeline = pipeline(QueryConfig::default(), receiver.clone());
        let request = QueryRequest::new(["600000", "AAPL", "0001.HK"]);

        let first = pipeline.execute_symbol_query(request.clone()).await;
        let second = pipeline.execute_symbol_query(request).await;

        assert_eq!(receiver.calls(), 3);
        assert!(second.cache_used);
        assert_eq!(second.data_sources.cache.hits, 3);
        assert_eq!(second.data_sources.realtime.hits, 0);
        assert_ne!(first.query_id, second.query_id);
        let first_data: Vec<&Payload> = first.results.iter().map(|r| &r.data).collect();
        let second_data: Vec<&Payload> = second.results.iter().map(|r| &r.data).collect();
        assert_eq!(first_data, second_data);
    }

    #[tokio::test]
    async fn test_invalid_and_duplicate_symbols() {
        let receiver = Arc::new(FakeReceiver::default());
        let pipeline = pipeline(QueryConfig::default(), receiver.clone());

        let result = pipeline
            .execute_symbol_query(QueryRequest::new(["AAPL", "  ", "aapl", "BAD SYMBOL!", "MSFT"]))
            .await;

        assert_eq!(receiver.calls(), 2);
        assert_eq!(result.results.len(), 2);
        assert_eq!(result.errors.len(), 2);
        assert_eq!(result.errors[0].symbol, "  ");
        assert_eq!(result.errors[1].symbol, "BAD SYMBOL!");
        assert!(result.errors[1].reason.contains("unsupported characters"));
    }

    #[tokio::test]
    async fn test_failing_batch_does_not_affect_sibling() {
        let all = symbols("S", 100);
        let receiver = Arc::new(FakeReceiver::failing(all[..50].to_vec()));
        let pipeline = pipeline(QueryConfig::default(), receiver.clone());

        let result = pipeline.execute_symbol_query(QueryRequest::new(all.clone())).await;

        assert_eq!(receiver.calls(), 100);
        assert_eq!(result.errors.len(), 50);
        assert_eq!(result.results.len(), 50);
        assert!(result.results.iter().all(|r| r.symbol >= all[50]));
        assert!(result.errors[0].reason.contains("upstream rejected"));
        assert_eq!(result.data_sources.realtime.misses, 50);
    }

    #[tokio::test]
    async fn test_every_symbol_lands_once() {
        let mut input = symbols("US", 120);
        input.extend(symbols("", 5).into_iter().map(|s| format!("600{s}")));
        input.push("BAD!".to_string());
        let receiver = Arc::new(FakeReceiver::failing(["US007".to_string(), "US100".to_string()]));
        let pipeline = pipeline(QueryConfig::default(), receiver);

        let result = pipeline.execute_symbol_query(QueryRequest::new(input.clone())).await;

        assert_eq!(result.results.len() + result.errors.len(), input.len());
        let mut seen: HashSet<String> = result.results.iter().map(|r| r.symbol.clone()).collect();
        for error in &result.errors {
            assert!(seen.insert(error.symbol.clone()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_batch_fails_only_its_symbols() {
        let config = QueryConfig {
            receiver_batch_size: 1,
            receiver_batch_timeout: Duration::from_secs(1),
            chunk_timeout: Duration::from_secs(5),
            market_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let receiver = Arc::new(FakeReceiver::slow("MSFT", Duration::from_secs(60)));
        let (metrics, mut events) = ChannelMetricsSink::new(16);
        let pipeline = pipeline(config, receiver).with_metrics(Arc::new(metrics));

        let started = Instant::now();
        let result = pipeline
            .execute_symbol_query(QueryRequest::new(["AAPL", "MSFT", "TSLA"]))
            .await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.results.len(), 2);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].symbol, "MSFT");
        assert!(result.errors[0].reason.contains("receiver batch timed out"));
        assert_eq!(result.data_sources.realtime.misses, 1);

        let mut timed_out = 0;
        while let Ok(event) = events.try_recv() {
            if let MetricsEvent::ShardTimedOut { market, symbols } = event {
                assert_eq!(market, Market::Us);
                assert_eq!(symbols, 1);
                timed_out += 1;
            }
        }
        assert_eq!(timed_out, 1);
    }

    #[tokio::test]
    async fn test_critical_memory_defers_everything() {
        let receiver = Arc::new(FakeReceiver::default());
        let monitor =
            MemoryPressureMonitor::new(MemoryConfig::default(), Arc::new(FixedUsage(0.95))).unwrap();
        let pipeline = pipeline(QueryConfig::default(), receiver.clone()).with_memory_monitor(monitor);

        let result = pipeline
            .execute_symbol_query(QueryRequest::new(["600000", "AAPL", "0001.HK", "!!"]))
            .await;

        assert_eq!(receiver.calls(), 0);
        assert!(result.results.is_empty());
        assert_eq!(result.errors.len(), 4);
        assert!(result.errors[..3].iter().all(|e| e.reason.contains("memory")));
        assert_eq!(result.errors[3].symbol, "!!");
    }

    #[tokio::test]
    async fn test_warning_memory_shrinks_batch() {
        let receiver = Arc::new(FakeReceiver::default());
        let monitor =
            MemoryPressureMonitor::new(MemoryConfig::default(), Arc::new(FixedUsage(0.80))).unwrap();
        let expected = monitor.check_before_batch(12).suggested_batch_size.unwrap();
        let pipeline = pipeline(QueryConfig::default(), receiver.clone()).with_memory_monitor(monitor);

        let mut input = symbols("US", 6);
        input.extend((0..6).map(|i| format!("60000{i}")));
        let result = pipeline.execute_symbol_query(QueryRequest::new(input)).await;

        assert!(expected < 12);
        assert_eq!(result.results.len(), expected);
        assert_eq!(receiver.calls(), expected);
        assert_eq!(result.errors.len(), 12 - expected);
        assert!(
            result
                .errors
                .iter()
                .all(|e| e.reason.contains("deferred under memory pressure"))
        );
        // CN sorts first, so the kept symbols are mainland codes
        assert!(result.results.iter().all(|r| r.symbol.starts_with("6000")));
    }

    #[tokio::test]
    async fn test_projection_and_pagination() {
        let receiver = Arc::new(FakeReceiver::default());
        let pipeline = pipeline(QueryConfig::default(), receiver);

        let request = QueryRequest::new(["A", "B", "C", "D", "E"])
            .with_options(crate::types::QueryOptions {
                include_fields: vec!["symbol".into(), "last".into(), "volume".into()],
                exclude_fields: vec!["volume".into()],
            })
            .with_page(2, 2);
        let result = pipeline.execute_symbol_query(request).await;

        let page: Vec<&str> = result.results.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(page, vec!["C", "D"]);
        assert_eq!(result.results[0].data, json!({ "symbol": "C", "last": 10.5 }));

        let pagination = result.pagination.unwrap();
        assert_eq!(pagination.total, 5);
        assert_eq!(pagination.total_pages, 3);
        assert!(pagination.has_next);
        assert!(pagination.has_prev);
        assert_eq!(result.data_sources.realtime.hits, 5);
    }

    #[tokio::test]
    async fn test_market_aware_query_uses_status_ttl() {
        let receiver = Arc::new(FakeReceiver::default());
        let status = StaticMarketStatus::new().with_status(Market::Us, MarketStatus::holiday());
        let pipeline =
            pipeline(QueryConfig::default(), receiver).with_market_status(Arc::new(status));

        pipeline
            .execute_symbol_query(
                QueryRequest::new(["AAPL", "600000"]).with_strategy(CacheStrategy::MarketAware),
            )
            .await;

        let us = pipeline
            .cache()
            .entry("smart_cache:auto:get-stock-quote:AAPL")
            .unwrap();
        assert_eq!(us.ttl, Duration::from_secs(3600));
        // No status for CN, so the fallback applies
        let cn = pipeline
            .cache()
            .entry("smart_cache:auto:get-stock-quote:600000")
            .unwrap();
        assert_eq!(cn.ttl, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_fresh_data_is_persisted() {
        let receiver = Arc::new(FakeReceiver::default());
        let storage = Arc::new(RecordingStorage::default());
        let pipeline = pipeline(QueryConfig::default(), receiver).with_storage(storage.clone());
        let request = QueryRequest::new(["AAPL"]).with_provider("longport");

        pipeline.execute_symbol_query(request.clone()).await;
        pipeline.execute_symbol_query(request).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let keys = storage.keys.lock().unwrap().clone();
        assert_eq!(
            keys,
            vec![(
                "longport:get-stock-quote:AAPL".to_string(),
                StorageClassification::StockQuote
            )]
        );
    }

    #[tokio::test]
    async fn test_sequential_markets_match_parallel() {
        let input = ["AAPL", "600000", "0700.HK", "MSFT"];
        let parallel = pipeline(QueryConfig::default(), Arc::new(FakeReceiver::default()))
            .execute_symbol_query(QueryRequest::new(input))
            .await;
        let sequential = pipeline(
            QueryConfig {
                sequential_markets: true,
                ..Default::default()
            },
            Arc::new(FakeReceiver::default()),
        )
        .execute_symbol_query(QueryRequest::new(input))
        .await;

        assert_eq!(parallel.results, sequential.results);
    }

    #[tokio::test]
    async fn test_forced_market_drives_status_ttl() {
        let receiver = Arc::new(FakeReceiver::default());
        let status = StaticMarketStatus::new()
            .with_status(Market::Hk, MarketStatus::holiday())
            .with_status(Market::Cn, MarketStatus::trading());
        let pipeline =
            pipeline(QueryConfig::default(), receiver).with_market_status(Arc::new(status));

        let result = pipeline
            .execute_symbol_query(
                QueryRequest::new(["700"])
                    .with_market(Market::Hk)
                    .with_strategy(CacheStrategy::MarketAware),
            )
            .await;

        assert_eq!(result.results[0].data["market"], json!("HK"));
        let entry = pipeline
            .cache()
            .entry("smart_cache:auto:get-stock-quote:700")
            .unwrap();
        assert_eq!(entry.ttl, Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_market_status_falls_back() {
        let receiver = Arc::new(FakeReceiver::default());
        let config = QueryConfig {
            market_status_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let pipeline =
            pipeline(config, receiver.clone()).with_market_status(Arc::new(StalledStatus));

        let started = Instant::now();
        let result = pipeline
            .execute_symbol_query(
                QueryRequest::new(["AAPL"]).with_strategy(CacheStrategy::MarketAware),
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(result.results.len(), 1);
        assert!(result.errors.is_empty());
        assert_eq!(receiver.calls(), 1);
        let entry = pipeline
            .cache()
            .entry("smart_cache:auto:get-stock-quote:AAPL")
            .unwrap();
        assert_eq!(entry.ttl, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_storage_failure_is_swallowed() {
        let receiver = Arc::new(FakeReceiver::default());
        let storage = Arc::new(FailingStorage::default());
        let pipeline = pipeline(QueryConfig::default(), receiver).with_storage(storage.clone());

        let result = pipeline
            .execute_symbol_query(QueryRequest::new(["AAPL", "600000"]))
            .await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(result.results.len(), 2);
        assert!(result.errors.is_empty());
        assert_eq!(storage.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_chunk_fails_whole_chunk_only() {
        let config = QueryConfig {
            market_chunk_size: 2,
            receiver_batch_size: 1,
            receiver_batch_timeout: Duration::from_secs(10),
            chunk_timeout: Duration::from_secs(2),
            market_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        let receiver = Arc::new(FakeReceiver::slow("AAPL", Duration::from_secs(60)));
        let (metrics, mut events) = ChannelMetricsSink::new(16);
        let pipeline = pipeline(config, receiver).with_metrics(Arc::new(metrics));

        let started = Instant::now();
        let result = pipeline
            .execute_symbol_query(QueryRequest::new(["AAPL", "MSFT", "TSLA", "600000"]))
            .await;

        assert!(started.elapsed() < Duration::from_secs(3));
        let failed: Vec<&str> = result.errors.iter().map(|e| e.symbol.as_str()).collect();
        assert_eq!(failed, vec!["AAPL", "MSFT"]);
        assert!(
            result
                .errors
                .iter()
                .all(|e| e.reason.contains("market chunk timed out (market=US chunk=0)"))
        );
        let served: Vec<&str> = result.results.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(served, vec!["TSLA", "600000"]);
        assert_eq!(result.data_sources.realtime.misses, 2);

        let mut timed_out = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let MetricsEvent::ShardTimedOut { market, symbols } = event {
                timed_out.push((market, symbols));
            }
        }
        assert_eq!(timed_out, vec![(Market::Us, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_market_fails_only_that_market() {
        let config = QueryConfig {
            receiver_batch_timeout: Duration::from_secs(10),
            chunk_timeout: Duration::from_secs(20),
            market_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        let receiver = Arc::new(FakeReceiver::slow("AAPL", Duration::from_secs(60)));
        let mut pipeline = pipeline(config, receiver);
        // Below every inner deadline, so the market level is the one that fires.
        pipeline.config.market_timeout = Duration::from_secs(2);

        let result = pipeline
            .execute_symbol_query(QueryRequest::new(["AAPL", "MSFT", "0700.HK"]))
            .await;

        let failed: Vec<&str> = result.errors.iter().map(|e| e.symbol.as_str()).collect();
        assert_eq!(failed, vec!["AAPL", "MSFT"]);
        assert!(
            result
                .errors
                .iter()
                .all(|e| e.reason.contains("market shard timed out (market=US chunk=0)"))
        );
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].symbol, "0700.HK");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = QueryConfig {
            receiver_batch_size: 0,
            ..Default::default()
        };
        let err = QueryPipeline::new(config, cache(), Arc::new(FakeReceiver::default())).unwrap_err();
        assert!(matches!(err, DataError::InvalidConfig(_)));
    }
}
