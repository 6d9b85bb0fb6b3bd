#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/marketdata/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Core traits and types for the market-data aggregation engine.
//!
//! This crate provides the foundational abstractions shared by the cache and
//! query crates:
//!
//! - [`Receiver`](provider::Receiver) - Upstream fetch of one symbol
//! - [`Storage`](provider::Storage) - Best-effort persistence of fetched data
//! - [`MarketStatusProvider`](provider::MarketStatusProvider) - Live trading state
//! - [`Clock`](clock::Clock) - Time source for cache expiry
//! - [`MetricsSink`](events::MetricsSink) - Non-blocking event emission
//! - [`EngineConfig`](config::EngineConfig) - Immutable startup configuration

/// Time source abstraction.
pub mod clock;
/// Engine configuration.
pub mod config;
/// Error types for market-data operations.
pub mod error;
/// Metrics events and sinks.
pub mod events;
/// Collaborator traits.
pub mod provider;
/// Cache strategy definitions.
pub mod strategy;
/// Core data types (Symbol, Market, MarketStatus, etc.).
pub mod types;

// Re-export commonly used items at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, EngineConfig, MemoryConfig, QueryConfig};
pub use error::{DataError, Result};
pub use events::{ChannelMetricsSink, MetricsEvent, MetricsSink, NoopMetricsSink};
pub use provider::{MarketStatusProvider, Receiver, StaticMarketStatus, Storage};
pub use strategy::{AdaptiveSignal, CacheStrategy};
pub use types::{
    FetchOptions, Market, MarketStatus, Payload, StorageClassification, Symbol, TradingStatus,
};
