#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/marketdata/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Market-data aggregation engine.
//!
//! This crate re-exports the workspace crates and wires them into a
//! [`MarketDataService`]: a smart cache in front of an upstream [`Receiver`],
//! fed by a sharded, memory-aware query pipeline.
//!
//! # Features
//!
//! - `sqlite` - SQLite-backed [`Storage`] for fetched data (off by default)

/// Trading-hours market status.
pub mod calendar;
/// Subscriber setup for `tracing`.
pub mod logging;
/// Service builder.
pub mod service;

// Core types and traits
pub use marketdata_core::{
    AdaptiveSignal, CacheConfig, CacheStrategy, ChannelMetricsSink, Clock, DataError,
    EngineConfig, FetchOptions, ManualClock, Market, MarketStatus, MarketStatusProvider,
    MemoryConfig, MetricsEvent, MetricsSink, NoopMetricsSink, Payload, QueryConfig, Receiver,
    Result, StaticMarketStatus, Storage, StorageClassification, Symbol, SystemClock,
    TradingStatus,
};

// Cache
pub use marketdata_cache::{
    CacheEntry, CacheRequest, CacheResult, CacheStats, DataFlow, InvalidationMessage,
    RefreshPriority, RefreshStatus, ShutdownReport, SmartCacheOrchestrator, StrategyResolver,
    data_flow,
};

// Query pipeline
pub use marketdata_query::{
    DataSource, DataSources, HitMiss, MemoryCheckResult, MemoryPressureMonitor, MemorySample,
    MemorySampler, Pagination, PressureLevel, ProcMemorySampler, QueryErrorInfo,
    QueryExecutionResult, QueryOptions, QueryPipeline, QueryRequest, QueryType, Recommendation,
    SymbolDataResult,
};

// Storage implementations
#[cfg(feature = "sqlite")]
pub use marketdata_storage::SqliteStorage;
pub use marketdata_storage::{InMemoryStorage, NoopStorage, StoredRecord};

pub use calendar::TradingCalendar;
pub use logging::{LogConfig, LogFormat, init_logging, init_logging_from_env};
pub use service::{MarketDataService, MarketDataServiceBuilder};
