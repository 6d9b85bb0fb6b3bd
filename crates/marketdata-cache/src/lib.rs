#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/marketdata/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Smart caching for the market-data engine.
//!
//! - [`SmartCacheOrchestrator`] - Read-through cache with background refresh
//! - [`StrategyResolver`] - Strategy to TTL mapping
//! - [`EntryStore`] - LRU entry storage
//! - [`TimerSet`] - Cancellable periodic tasks

/// Cache entries and their LRU store.
pub mod entry;
/// The orchestrator.
pub mod orchestrator;
/// Background refresh bookkeeping.
pub mod refresh;
/// Strategy resolution.
pub mod strategy;
/// Managed timers.
pub mod timers;

pub use entry::{CacheEntry, EntryStore};
pub use orchestrator::{
    CacheRequest, CacheResult, CacheStats, DataFlow, InvalidationMessage, ShutdownReport,
    SmartCacheOrchestrator, data_flow,
};
pub use refresh::{BackgroundRefreshTask, RefreshPriority, RefreshStatus};
pub use strategy::{AdaptiveTtlPolicy, ResolvedPolicy, StrategyResolver, VolatilityScaledPolicy};
pub use timers::TimerSet;
