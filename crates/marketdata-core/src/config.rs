//! Engine configuration.
//!
//! A single immutable [`EngineConfig`] is built at startup (from defaults, code,
//! or `MARKETDATA_*` environment variables) and handed to each component by
//! value. There is no global configuration.

use std::str::FromStr;
use std::time::Duration;

use crate::{
    error::{DataError, Result},
    strategy::CacheStrategy,
};

/// Complete configuration for the engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Smart cache settings.
    pub cache: CacheConfig,
    /// Batched query pipeline settings.
    pub query: QueryConfig,
    /// Memory pressure monitor settings.
    pub memory: MemoryConfig,
}

/// Smart cache orchestrator settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL for [`CacheStrategy::StrongTimeliness`].
    pub strong_ttl: Duration,
    /// TTL for [`CacheStrategy::WeakTimeliness`].
    pub weak_ttl: Duration,
    /// Market-aware TTL while the market is trading.
    pub market_trading_ttl: Duration,
    /// Market-aware TTL while the market is closed.
    pub market_closed_ttl: Duration,
    /// Market-aware TTL on a market holiday.
    pub market_holiday_ttl: Duration,
    /// TTL used when market status is unknown.
    pub fallback_ttl: Duration,
    /// Baseline TTL for [`CacheStrategy::Adaptive`].
    pub adaptive_base_ttl: Duration,
    /// Lower bound for adaptive TTLs.
    pub adaptive_min_ttl: Duration,
    /// Upper bound for adaptive TTLs.
    pub adaptive_max_ttl: Duration,
    /// Fraction of the TTL after which a read schedules a background refresh.
    pub refresh_ahead_ratio: f64,
    /// Maximum number of cache entries before LRU eviction.
    pub max_entries: usize,
    /// Largest serialized payload accepted into the cache.
    pub max_entry_bytes: usize,
    /// Maximum concurrently running background refreshes.
    pub max_concurrent_updates: usize,
    /// Attempts per background refresh before it is dropped.
    pub refresh_max_attempts: u32,
    /// Base delay of the exponential refresh backoff.
    pub refresh_backoff: Duration,
    /// Upper bound on the wait for in-flight refreshes at shutdown.
    pub graceful_shutdown_timeout: Duration,
    /// How often shutdown re-checks in-flight refreshes.
    pub shutdown_poll_interval: Duration,
    /// Period of the expired-entry sweep.
    pub cleanup_interval: Duration,
    /// Period of the stats log line.
    pub stats_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strong_ttl: Duration::from_secs(60),
            weak_ttl: Duration::from_secs(300),
            market_trading_ttl: Duration::from_secs(60),
            market_closed_ttl: Duration::from_secs(1800),
            market_holiday_ttl: Duration::from_secs(3600),
            fallback_ttl: Duration::from_secs(300),
            adaptive_base_ttl: Duration::from_secs(300),
            adaptive_min_ttl: Duration::from_secs(30),
            adaptive_max_ttl: Duration::from_secs(3600),
            refresh_ahead_ratio: 0.8,
            max_entries: 10_000,
            max_entry_bytes: 1024 * 1024,
            max_concurrent_updates: 4,
            refresh_max_attempts: 3,
            refresh_backoff: Duration::from_millis(200),
            graceful_shutdown_timeout: Duration::from_secs(30),
            shutdown_poll_interval: Duration::from_millis(100),
            cleanup_interval: Duration::from_secs(60),
            stats_interval: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    /// Checks the settings for values the orchestrator cannot work with.
    ///
    /// # Errors
    /// Returns [`DataError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.refresh_ahead_ratio) {
            return Err(DataError::InvalidConfig(format!(
                "refresh_ahead_ratio must be within [0, 1], got {}",
                self.refresh_ahead_ratio
            )));
        }
        if self.adaptive_min_ttl > self.adaptive_max_ttl {
            return Err(DataError::InvalidConfig(
                "adaptive_min_ttl must not exceed adaptive_max_ttl".to_string(),
            ));
        }
        if self.max_entries == 0 {
            return Err(DataError::InvalidConfig("max_entries must be > 0".to_string()));
        }
        if self.max_concurrent_updates == 0 {
            return Err(DataError::InvalidConfig(
                "max_concurrent_updates must be > 0".to_string(),
            ));
        }
        if self.refresh_max_attempts == 0 {
            return Err(DataError::InvalidConfig(
                "refresh_max_attempts must be > 0".to_string(),
            ));
        }
        if self.shutdown_poll_interval.is_zero()
            || self.cleanup_interval.is_zero()
            || self.stats_interval.is_zero()
        {
            return Err(DataError::InvalidConfig(
                "timer intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Batched query pipeline settings.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// Symbols per market chunk.
    pub market_chunk_size: usize,
    /// Symbols per upstream receiver batch.
    pub receiver_batch_size: usize,
    /// Deadline for one market's shard.
    pub market_timeout: Duration,
    /// Deadline for one market chunk.
    pub chunk_timeout: Duration,
    /// Deadline for one receiver batch.
    pub receiver_batch_timeout: Duration,
    /// Deadline for the market-status lookup of one query.
    pub market_status_timeout: Duration,
    /// Strategy used when a request does not name one.
    pub default_strategy: CacheStrategy,
    /// Receiver capability used when a request does not name one.
    pub default_receiver_type: String,
    /// Process markets one after another instead of concurrently.
    pub sequential_markets: bool,
    /// Page size used when a request sets `page` without `limit`.
    pub default_page_limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            market_chunk_size: 100,
            receiver_batch_size: 50,
            market_timeout: Duration::from_secs(30),
            chunk_timeout: Duration::from_secs(30),
            receiver_batch_timeout: Duration::from_secs(15),
            market_status_timeout: Duration::from_secs(5),
            default_strategy: CacheStrategy::WeakTimeliness,
            default_receiver_type: "get-stock-quote".to_string(),
            sequential_markets: false,
            default_page_limit: 20,
        }
    }
}

impl QueryConfig {
    /// Checks the sharding settings.
    ///
    /// # Errors
    /// Returns [`DataError::InvalidConfig`] for zero chunk sizes, zero timeouts,
    /// a chunk timeout above the market timeout, or a receiver-batch timeout
    /// not shorter than the market timeout.
    pub fn validate(&self) -> Result<()> {
        if self.market_chunk_size == 0 || self.receiver_batch_size == 0 {
            return Err(DataError::InvalidConfig(
                "chunk and batch sizes must be > 0".to_string(),
            ));
        }
        if self.market_timeout.is_zero()
            || self.chunk_timeout.is_zero()
            || self.receiver_batch_timeout.is_zero()
            || self.market_status_timeout.is_zero()
        {
            return Err(DataError::InvalidConfig("timeouts must be > 0".to_string()));
        }
        if self.chunk_timeout > self.market_timeout {
            return Err(DataError::InvalidConfig(
                "chunk_timeout must not exceed market_timeout".to_string(),
            ));
        }
        if self.receiver_batch_timeout >= self.market_timeout {
            return Err(DataError::InvalidConfig(
                "receiver_batch_timeout must be shorter than market_timeout".to_string(),
            ));
        }
        if self.default_page_limit == 0 {
            return Err(DataError::InvalidConfig(
                "default_page_limit must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Memory pressure monitor settings.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// When false every check returns `Proceed` without sampling.
    pub enabled: bool,
    /// Usage fraction at which batches are reduced.
    pub warning_threshold: f64,
    /// Usage fraction at which batches are deferred.
    pub critical_threshold: f64,
    /// Scale applied to the batch size under warning pressure.
    pub reduction_factor: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warning_threshold: 0.75,
            critical_threshold: 0.90,
            reduction_factor: 0.5,
        }
    }
}

impl MemoryConfig {
    /// Checks the thresholds.
    ///
    /// # Errors
    /// Returns [`DataError::InvalidConfig`] unless
    /// `0 < warning < critical <= 1` and `0 < reduction_factor <= 1`.
    pub fn validate(&self) -> Result<()> {
        let ordered = 0.0 < self.warning_threshold
            && self.warning_threshold < self.critical_threshold
            && self.critical_threshold <= 1.0;
        if !ordered {
            return Err(DataError::InvalidConfig(format!(
                "expected 0 < warning ({}) < critical ({}) <= 1",
                self.warning_threshold, self.critical_threshold
            )));
        }
        if !(self.reduction_factor > 0.0 && self.reduction_factor <= 1.0) {
            return Err(DataError::InvalidConfig(format!(
                "reduction_factor must be within (0, 1], got {}",
                self.reduction_factor
            )));
        }
        Ok(())
    }
}

impl EngineConfig {
    /// Validates every section.
    ///
    /// # Errors
    /// Returns the first [`DataError::InvalidConfig`] found.
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.query.validate()?;
        self.memory.validate()
    }

    /// Builds a configuration from defaults overridden by environment variables.
    ///
    /// A `.env` file is loaded first if present. Durations are given in
    /// milliseconds.
    ///
    /// | variable | field |
    /// |---|---|
    /// | `MARKETDATA_STRONG_TTL_MS` | `cache.strong_ttl` |
    /// | `MARKETDATA_WEAK_TTL_MS` | `cache.weak_ttl` |
    /// | `MARKETDATA_MAX_ENTRIES` | `cache.max_entries` |
    /// | `MARKETDATA_MAX_CONCURRENT_UPDATES` | `cache.max_concurrent_updates` |
    /// | `MARKETDATA_SHUTDOWN_TIMEOUT_MS` | `cache.graceful_shutdown_timeout` |
    /// | `MARKETDATA_MARKET_CHUNK_SIZE` | `query.market_chunk_size` |
    /// | `MARKETDATA_RECEIVER_BATCH_SIZE` | `query.receiver_batch_size` |
    /// | `MARKETDATA_MARKET_TIMEOUT_MS` | `query.market_timeout` |
    /// | `MARKETDATA_CHUNK_TIMEOUT_MS` | `query.chunk_timeout` |
    /// | `MARKETDATA_RECEIVER_BATCH_TIMEOUT_MS` | `query.receiver_batch_timeout` |
    /// | `MARKETDATA_MARKET_STATUS_TIMEOUT_MS` | `query.market_status_timeout` |
    /// | `MARKETDATA_SEQUENTIAL_MARKETS` | `query.sequential_markets` |
    /// | `MARKETDATA_MEMORY_MONITOR` | `memory.enabled` |
    /// | `MARKETDATA_MEMORY_WARNING` | `memory.warning_threshold` |
    /// | `MARKETDATA_MEMORY_CRITICAL` | `memory.critical_threshold` |
    ///
    /// # Errors
    /// Returns [`DataError::InvalidConfig`] if a variable cannot be parsed or the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let cache = CacheConfig {
            strong_ttl: env_millis("MARKETDATA_STRONG_TTL_MS", defaults.cache.strong_ttl)?,
            weak_ttl: env_millis("MARKETDATA_WEAK_TTL_MS", defaults.cache.weak_ttl)?,
            max_entries: env_parse("MARKETDATA_MAX_ENTRIES", defaults.cache.max_entries)?,
            max_concurrent_updates: env_parse(
                "MARKETDATA_MAX_CONCURRENT_UPDATES",
                defaults.cache.max_concurrent_updates,
            )?,
            graceful_shutdown_timeout: env_millis(
                "MARKETDATA_SHUTDOWN_TIMEOUT_MS",
                defaults.cache.graceful_shutdown_timeout,
            )?,
            ..defaults.cache
        };
        let query = QueryConfig {
            market_chunk_size: env_parse(
                "MARKETDATA_MARKET_CHUNK_SIZE",
                defaults.query.market_chunk_size,
            )?,
            receiver_batch_size: env_parse(
                "MARKETDATA_RECEIVER_BATCH_SIZE",
                defaults.query.receiver_batch_size,
            )?,
            market_timeout: env_millis("MARKETDATA_MARKET_TIMEOUT_MS", defaults.query.market_timeout)?,
            chunk_timeout: env_millis("MARKETDATA_CHUNK_TIMEOUT_MS", defaults.query.chunk_timeout)?,
            receiver_batch_timeout: env_millis(
                "MARKETDATA_RECEIVER_BATCH_TIMEOUT_MS",
                defaults.query.receiver_batch_timeout,
            )?,
            market_status_timeout: env_millis(
                "MARKETDATA_MARKET_STATUS_TIMEOUT_MS",
                defaults.query.market_status_timeout,
            )?,
            sequential_markets: env_parse(
                "MARKETDATA_SEQUENTIAL_MARKETS",
                defaults.query.sequential_markets,
            )?,
            ..defaults.query
        };
        let memory = MemoryConfig {
            enabled: env_parse("MARKETDATA_MEMORY_MONITOR", defaults.memory.enabled)?,
            warning_threshold: env_parse(
                "MARKETDATA_MEMORY_WARNING",
                defaults.memory.warning_threshold,
            )?,
            critical_threshold: env_parse(
                "MARKETDATA_MEMORY_CRITICAL",
                defaults.memory.critical_threshold,
            )?,
            ..defaults.memory
        };

        let config = Self {
            cache,
            query,
            memory,
        };
        config.validate()?;
        Ok(config)
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| DataError::InvalidConfig(format!("{name}: cannot parse {raw:?}"))),
        Err(_) => Ok(default),
    }
}

fn env_millis(name: &str, default: Duration) -> Result<Duration> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    env_parse(name, default_ms).map(Duration::from_millis)
}
