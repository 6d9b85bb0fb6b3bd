//! Smart cache orchestrator.
//!
//! [`SmartCacheOrchestrator`] serves each request from its entry store when the
//! entry is still fresh, otherwise runs the request's data flow exactly once and
//! caches the result under the TTL its strategy resolves to. Fresh entries past
//! their refresh-ahead age are re-fetched in the background on a bounded worker
//! pool, without delaying the read that noticed them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, join_all};
use marketdata_core::{
    AdaptiveSignal, CacheConfig, CacheStrategy, Clock, DataError, Market, MarketStatus,
    MetricsEvent, MetricsSink, Payload, Result, Symbol,
};
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    entry::{CacheEntry, EntryStore},
    refresh::{BackgroundRefreshTask, QueuedRefresh, RefreshPriority, RefreshState, RefreshStatus},
    strategy::StrategyResolver,
    timers::TimerSet,
};

/// Callback that fetches fresh data for a request.
pub type DataFlow = Arc<dyn Fn() -> BoxFuture<'static, Result<Payload>> + Send + Sync>;

/// Wraps an async closure as a [`DataFlow`].
pub fn data_flow<F, Fut>(f: F) -> DataFlow
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
{
    Arc::new(move || -> BoxFuture<'static, Result<Payload>> { Box::pin(f()) })
}

/// One cache lookup.
#[derive(Clone)]
pub struct CacheRequest {
    /// Symbols the data covers.
    pub symbols: Vec<Symbol>,
    /// Receiver capability (e.g. `get-stock-quote`).
    pub receiver_type: String,
    /// Upstream provider, if pinned.
    pub provider: Option<String>,
    /// Identifier of the top-level query, for logs.
    pub query_id: String,
    /// Cache strategy.
    pub strategy: CacheStrategy,
    /// Market the symbols were grouped under; inferred from the first symbol when unset.
    pub market: Option<Market>,
    /// Known market states, keyed by market.
    pub market_status: HashMap<Market, MarketStatus>,
    /// Volatility hint for the adaptive strategy.
    pub volatility: Option<f64>,
    /// Fetches fresh data; run once on a miss and again by background refreshes.
    pub execute_original_data_flow: DataFlow,
}

impl fmt::Debug for CacheRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRequest")
            .field("symbols", &self.symbols)
            .field("receiver_type", &self.receiver_type)
            .field("provider", &self.provider)
            .field("query_id", &self.query_id)
            .field("strategy", &self.strategy)
            .field("market", &self.market)
            .field("market_status", &self.market_status)
            .field("volatility", &self.volatility)
            .finish_non_exhaustive()
    }
}

impl CacheRequest {
    /// Creates a request with the default strategy and no market context.
    #[must_use]
    pub fn new(symbols: Vec<Symbol>, receiver_type: impl Into<String>, flow: DataFlow) -> Self {
        Self {
            symbols,
            receiver_type: receiver_type.into(),
            provider: None,
            query_id: String::new(),
            strategy: CacheStrategy::default(),
            market: None,
            market_status: HashMap::new(),
            volatility: None,
            execute_original_data_flow: flow,
        }
    }

    /// Sets the strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Pins the upstream provider.
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Sets the query id.
    #[must_use]
    pub fn with_query_id(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = query_id.into();
        self
    }

    /// Pins the market, overriding inference from the symbols.
    #[must_use]
    pub fn with_market(mut self, market: Market) -> Self {
        self.market = Some(market);
        self
    }

    /// Sets the known market states.
    #[must_use]
    pub fn with_market_status(mut self, market_status: HashMap<Market, MarketStatus>) -> Self {
        self.market_status = market_status;
        self
    }

    /// Sets the volatility hint.
    #[must_use]
    pub fn with_volatility(mut self, volatility: f64) -> Self {
        self.volatility = Some(volatility);
        self
    }

    /// Composite key of provider, capability and symbols.
    #[must_use]
    pub fn cache_key(&self) -> String {
        let mut symbols: Vec<&str> = self.symbols.iter().map(Symbol::as_str).collect();
        symbols.sort_unstable();
        symbols.dedup();
        format!(
            "smart_cache:{}:{}:{}",
            self.provider.as_deref().unwrap_or("auto"),
            self.receiver_type,
            symbols.join(",")
        )
    }

    /// The pinned market, else the market of the first symbol.
    #[must_use]
    pub fn market(&self) -> Option<Market> {
        self.market.or_else(|| self.symbols.first().map(Symbol::market))
    }

    fn status(&self) -> Option<&MarketStatus> {
        self.market().and_then(|m| self.market_status.get(&m))
    }
}

/// Outcome of one cache lookup.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheResult {
    /// Cache key of the request.
    pub key: String,
    /// Strategy of the request.
    pub strategy: CacheStrategy,
    /// True if served from cache.
    pub hit: bool,
    /// Data, from cache or freshly fetched. `None` only if the fetch failed.
    pub data: Option<Payload>,
    /// Fetch error, if any.
    pub error: Option<String>,
}

impl CacheResult {
    fn hit(key: String, strategy: CacheStrategy, data: Payload) -> Self {
        Self {
            key,
            strategy,
            hit: true,
            data: Some(data),
            error: None,
        }
    }

    fn miss(key: String, strategy: CacheStrategy, outcome: Result<Payload>) -> Self {
        let (data, error) = match outcome {
            Ok(data) => (Some(data), None),
            Err(e) => (None, Some(e.to_string())),
        };
        Self {
            key,
            strategy,
            hit: false,
            data,
            error,
        }
    }

    /// Returns true if data is available.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.data.is_some()
    }
}

/// External invalidation notice, e.g. from a change stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvalidationMessage {
    /// Drop one key.
    Key(String),
    /// Drop every entry covering a symbol.
    Symbol(Symbol),
    /// Drop everything.
    All,
}

/// Counters snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from cache.
    pub hits: u64,
    /// Reads that went to the data flow.
    pub misses: u64,
    /// Data flows that failed on the read path.
    pub fetch_errors: u64,
    /// Cache writes rejected by the store.
    pub store_errors: u64,
    /// Entries evicted by capacity.
    pub evictions: u64,
    /// Background refreshes started.
    pub refreshes_started: u64,
    /// Background refreshes that overwrote their entry.
    pub refreshes_succeeded: u64,
    /// Background refreshes that gave up.
    pub refreshes_failed: u64,
    /// Entries currently stored.
    pub entries: usize,
    /// Refreshes waiting for a worker.
    pub queued_refreshes: usize,
    /// Refreshes running.
    pub running_refreshes: usize,
}

/// What happened during [`SmartCacheOrchestrator::shutdown`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Timers cancelled.
    pub timers_cancelled: usize,
    /// Queued refreshes dropped without running.
    pub queued_dropped: usize,
    /// Refreshes still running when the wait ended.
    pub abandoned: usize,
    /// Time spent waiting for in-flight refreshes.
    pub waited: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetch_errors: AtomicU64,
    store_errors: AtomicU64,
    evictions: AtomicU64,
    refreshes_started: AtomicU64,
    refreshes_succeeded: AtomicU64,
    refreshes_failed: AtomicU64,
}

#[derive(Debug)]
struct Inner {
    config: CacheConfig,
    resolver: StrategyResolver,
    store: Mutex<EntryStore>,
    refresh: Mutex<RefreshState>,
    timers: Mutex<TimerSet>,
    permits: Arc<Semaphore>,
    in_flight: AtomicUsize,
    started: AtomicBool,
    shutting_down: AtomicBool,
    shutdown_token: CancellationToken,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    counters: Counters,
}

/// Read-through cache with strategy-driven TTLs and background refresh.
///
/// Cloning is cheap; clones share the same cache.
#[derive(Debug, Clone)]
pub struct SmartCacheOrchestrator {
    inner: Arc<Inner>,
}

impl SmartCacheOrchestrator {
    /// Creates an orchestrator with the default strategy resolver.
    ///
    /// # Errors
    /// Returns [`DataError::InvalidConfig`] if `config` fails validation.
    pub fn new(
        config: CacheConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let resolver = StrategyResolver::new(config.clone());
        Self::with_resolver(config, resolver, clock, metrics)
    }

    /// Creates an orchestrator with a custom resolver.
    ///
    /// # Errors
    /// Returns [`DataError::InvalidConfig`] if `config` fails validation.
    pub fn with_resolver(
        config: CacheConfig,
        resolver: StrategyResolver,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;
        let inner = Inner {
            store: Mutex::new(EntryStore::new(config.max_entries, config.max_entry_bytes)),
            refresh: Mutex::new(RefreshState::default()),
            timers: Mutex::new(TimerSet::new()),
            permits: Arc::new(Semaphore::new(config.max_concurrent_updates)),
            in_flight: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
            counters: Counters::default(),
            config,
            resolver,
            clock,
            metrics,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Starts the periodic expired-entry sweep and stats log.
    ///
    /// Idempotent. Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Returns [`DataError::ShuttingDown`] after shutdown has begun.
    pub fn start(&self) -> Result<()> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(DataError::ShuttingDown);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut timers = self.inner.lock_timers();

        let sweeper = Arc::clone(&self.inner);
        timers.spawn_periodic("expired-sweep", self.inner.config.cleanup_interval, move || {
            let inner = Arc::clone(&sweeper);
            async move {
                let now = inner.clock.now_millis();
                let removed = inner.lock_store().sweep_expired(now);
                if removed > 0 {
                    debug!(removed, "Swept expired cache entries");
                }
            }
        });

        let reporter = Arc::clone(&self.inner);
        timers.spawn_periodic("stats-log", self.inner.config.stats_interval, move || {
            let inner = Arc::clone(&reporter);
            async move {
                let stats = inner.stats();
                info!(
                    hits = stats.hits,
                    misses = stats.misses,
                    entries = stats.entries,
                    running_refreshes = stats.running_refreshes,
                    queued_refreshes = stats.queued_refreshes,
                    "Smart cache stats"
                );
            }
        });

        debug!(timers = timers.len(), "Smart cache orchestrator started");
        Ok(())
    }

    /// Applies invalidation messages pushed on `rx` until it closes or shutdown.
    ///
    /// The expired-entry sweep started by [`SmartCacheOrchestrator::start`] is the
    /// polling fallback for deployments without a change feed.
    ///
    /// # Errors
    /// Returns [`DataError::ShuttingDown`] after shutdown has begun.
    pub fn watch_invalidations(&self, mut rx: mpsc::Receiver<InvalidationMessage>) -> Result<()> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(DataError::ShuttingDown);
        }
        let this = self.clone();
        self.inner
            .lock_timers()
            .spawn_task("invalidation-listener", async move {
                while let Some(message) = rx.recv().await {
                    let removed = match &message {
                        InvalidationMessage::Key(key) => usize::from(this.invalidate(key)),
                        InvalidationMessage::Symbol(symbol) => this.invalidate_symbol(symbol),
                        InvalidationMessage::All => this.clear(),
                    };
                    debug!(?message, removed, "Applied cache invalidation");
                }
            });
        Ok(())
    }

    /// Serves one request from cache or from its data flow.
    ///
    /// Never fails: fetch errors are reported in [`CacheResult::error`] and
    /// cache-write failures are logged.
    #[instrument(skip(self, request), fields(query_id = %request.query_id, strategy = %request.strategy))]
    pub async fn get_data_with_smart_cache(&self, request: CacheRequest) -> CacheResult {
        let key = request.cache_key();
        let strategy = request.strategy;

        if strategy != CacheStrategy::NoCache {
            let now = self.inner.clock.now_millis();
            let cached = self.inner.lock_store().get(&key, now).map(|entry| {
                let wants_refresh = entry.needs_refresh(now) && !entry.refresh_in_flight;
                (entry.value.clone(), wants_refresh, entry.hit_count)
            });

            if let Some((data, wants_refresh, hit_count)) = cached {
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.inner.metrics.emit(MetricsEvent::CacheHit {
                    key: key.clone(),
                    strategy,
                });
                debug!(key = %key, "Cache hit");
                if wants_refresh {
                    self.inner.schedule_refresh(&request, &key, hit_count, now);
                }
                return CacheResult::hit(key, strategy, data);
            }
        }

        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Cache miss, running data flow");

        let outcome = (request.execute_original_data_flow)().await;
        match &outcome {
            Ok(data) => self.inner.store_entry(&request, &key, data.clone()),
            Err(e) => {
                self.inner.counters.fetch_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Data flow failed on cache miss");
            }
        }
        self.inner.metrics.emit(MetricsEvent::CacheMiss {
            key: key.clone(),
            strategy,
            fetched: outcome.is_ok(),
        });

        CacheResult::miss(key, strategy, outcome)
    }

    /// Serves several requests concurrently, preserving input order.
    pub async fn batch_get_data_with_smart_cache(
        &self,
        requests: Vec<CacheRequest>,
    ) -> Vec<CacheResult> {
        join_all(
            requests
                .into_iter()
                .map(|request| self.get_data_with_smart_cache(request)),
        )
        .await
    }

    /// Drops one key. A refresh running for it is discarded when it finishes.
    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.lock_refresh().forget(key);
        self.inner.lock_store().remove(key).is_some()
    }

    /// Drops every entry covering `symbol`, returning how many were removed.
    pub fn invalidate_symbol(&self, symbol: &Symbol) -> usize {
        let keys = self.inner.lock_store().keys_for_symbol(symbol);
        keys.iter().filter(|key| self.invalidate(key)).count()
    }

    /// Drops everything, returning how many entries were removed.
    pub fn clear(&self) -> usize {
        let mut refresh = self.inner.lock_refresh();
        let mut store = self.inner.lock_store();
        for key in store.keys() {
            refresh.forget(&key);
        }
        let removed = store.len();
        store.clear();
        removed
    }

    /// Snapshot of an entry, without counting as a read.
    #[must_use]
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.inner.lock_store().peek(key).cloned()
    }

    /// Snapshot of registered refresh tasks.
    #[must_use]
    pub fn refresh_tasks(&self) -> Vec<BackgroundRefreshTask> {
        self.inner.lock_refresh().tasks.values().cloned().collect()
    }

    /// Counters snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }

    /// Returns true once shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Stops background work and waits, bounded, for in-flight refreshes.
    ///
    /// Stops accepting refreshes, drops queued ones, cancels every owned timer,
    /// then polls until no refresh is running or `graceful_shutdown_timeout`
    /// elapses. Refreshes still running afterwards are abandoned. A second call
    /// returns immediately.
    pub async fn shutdown(&self) -> ShutdownReport {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            return ShutdownReport {
                timers_cancelled: 0,
                queued_dropped: 0,
                abandoned: inner.in_flight.load(Ordering::SeqCst),
                waited: Duration::ZERO,
            };
        }
        info!("Smart cache orchestrator shutting down");

        // Wakes refreshes sleeping in backoff.
        inner.shutdown_token.cancel();
        let timers_cancelled = inner.lock_timers().cancel_all();

        let dropped = inner.lock_refresh().drain_queued();
        {
            let mut store = inner.lock_store();
            for key in &dropped {
                if let Some(entry) = store.peek_mut(key) {
                    entry.refresh_in_flight = false;
                }
            }
        }

        let started = Instant::now();
        let deadline = started + inner.config.graceful_shutdown_timeout;
        let abandoned = loop {
            let running = inner.in_flight.load(Ordering::SeqCst);
            if running == 0 {
                break 0;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    running,
                    timeout_ms = inner.config.graceful_shutdown_timeout.as_millis() as u64,
                    "Graceful shutdown timed out, abandoning refreshes"
                );
                break running;
            }
            tokio::time::sleep(inner.config.shutdown_poll_interval.min(deadline - now)).await;
        };

        inner.lock_refresh().tasks.clear();

        let report = ShutdownReport {
            timers_cancelled,
            queued_dropped: dropped.len(),
            abandoned,
            waited: started.elapsed(),
        };
        info!(?report, "Smart cache orchestrator stopped");
        report
    }
}

impl Inner {
    fn lock_store(&self) -> MutexGuard<'_, EntryStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_refresh(&self) -> MutexGuard<'_, RefreshState> {
        self.refresh.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_timers(&self) -> MutexGuard<'_, TimerSet> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> CacheStats {
        let (queued_refreshes, running_refreshes) = {
            let refresh = self.lock_refresh();
            (refresh.queue.len(), refresh.running())
        };
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            fetch_errors: self.counters.fetch_errors.load(Ordering::Relaxed),
            store_errors: self.counters.store_errors.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            refreshes_started: self.counters.refreshes_started.load(Ordering::Relaxed),
            refreshes_succeeded: self.counters.refreshes_succeeded.load(Ordering::Relaxed),
            refreshes_failed: self.counters.refreshes_failed.load(Ordering::Relaxed),
            entries: self.lock_store().len(),
            queued_refreshes,
            running_refreshes,
        }
    }

    /// Writes fetched data under the resolved TTL. Failures are logged, never returned.
    fn store_entry(&self, request: &CacheRequest, key: &str, data: Payload) {
        let hit_count = self.lock_store().peek(key).map_or(0, |e| e.hit_count);
        let signal = AdaptiveSignal {
            volatility: request.volatility,
            hit_count,
        };
        let policy = self
            .resolver
            .resolve(request.strategy, request.status(), &signal);
        if policy.ttl.is_zero() {
            return;
        }

        let mut entry = CacheEntry::new(
            key,
            request.symbols.clone(),
            data,
            request.strategy,
            self.clock.now_millis(),
            policy.ttl,
        )
        .with_refresh_ahead(policy.refresh_ahead);
        entry.hit_count = hit_count;

        let inserted = self.lock_store().insert(entry);
        match inserted {
            Ok(evicted) => {
                if evicted > 0 {
                    self.counters
                        .evictions
                        .fetch_add(evicted as u64, Ordering::Relaxed);
                }
            }
            Err(e) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key, error = %e, "Failed to cache data");
            }
        }
    }

    fn refresh_priority(request: &CacheRequest, hit_count: u64) -> RefreshPriority {
        match request.status() {
            Some(status) if status.is_trading() => RefreshPriority::High,
            Some(_) => RefreshPriority::Low,
            None if hit_count >= 10 => RefreshPriority::High,
            None => RefreshPriority::Normal,
        }
    }

    /// Registers a refresh for `key` unless one exists, then fills free worker slots.
    fn schedule_refresh(self: &Arc<Self>, request: &CacheRequest, key: &str, hit_count: u64, now: i64) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let priority = Self::refresh_priority(request, hit_count);
        {
            let mut refresh = self.lock_refresh();
            let mut store = self.lock_store();
            let Some(entry) = store.peek_mut(key) else {
                return;
            };
            if refresh
                .enqueue(request.clone(), key.to_string(), priority, now)
                .is_none()
            {
                return;
            }
            entry.refresh_in_flight = true;
        }
        debug!(key, ?priority, "Scheduled background refresh");
        self.pump();
    }

    /// Starts queued refreshes while worker slots are free.
    fn pump(self: &Arc<Self>) {
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                return;
            };
            let Some(next) = self.lock_refresh().start_next() else {
                return;
            };

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            self.counters
                .refreshes_started
                .fetch_add(1, Ordering::Relaxed);

            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.run_refresh(next).await;
                drop(permit);
                inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                inner.pump();
            });
        }
    }

    async fn run_refresh(&self, queued: QueuedRefresh) {
        let QueuedRefresh { task, request } = queued;
        let max_attempts = self.config.refresh_max_attempts;

        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            match (request.execute_original_data_flow)().await {
                Ok(data) => break Ok(data),
                Err(e) if attempts >= max_attempts => break Err(e),
                Err(e) => {
                    let delay = self.config.refresh_backoff * 2u32.saturating_pow(attempts - 1);
                    debug!(key = %task.key, attempts, error = %e, "Refresh failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown_token.cancelled() => break Err(e),
                    }
                }
            }
        };

        let owned = self.lock_refresh().finish(&task.key, task.id);
        let status = match outcome {
            Ok(data) if owned => {
                self.store_entry(&request, &task.key, data);
                self.counters
                    .refreshes_succeeded
                    .fetch_add(1, Ordering::Relaxed);
                RefreshStatus::Done
            }
            Ok(_) => {
                debug!(key = %task.key, "Key invalidated during refresh, discarding result");
                RefreshStatus::Done
            }
            Err(e) => {
                if owned {
                    if let Some(entry) = self.lock_store().peek_mut(&task.key) {
                        entry.refresh_in_flight = false;
                    }
                }
                self.counters.refreshes_failed.fetch_add(1, Ordering::Relaxed);
                warn!(key = %task.key, attempts, error = %e, "Background refresh dropped");
                RefreshStatus::Failed
            }
        };

        debug!(key = %task.key, ?status, attempts, "Background refresh finished");
        self.metrics.emit(MetricsEvent::RefreshCompleted {
            key: task.key,
            success: status == RefreshStatus::Done,
            attempts,
        });
    }
}
