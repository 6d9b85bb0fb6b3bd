#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/marketdata/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

/// Memory pressure monitoring.
pub mod memory;
/// The batched query pipeline.
pub mod pipeline;
/// Result payload projection.
pub mod projection;
/// Sharding helpers.
pub mod shard;
/// Request and result types.
pub mod types;

pub use memory::{
    MemoryCheckResult, MemoryPressureMonitor, MemorySample, MemorySampler, PressureLevel,
    ProcMemorySampler, Recommendation,
};
pub use pipeline::QueryPipeline;
pub use shard::QueryBatchContext;
pub use types::{
    DataSource, DataSources, HitMiss, Pagination, QueryErrorInfo, QueryExecutionResult,
    QueryOptions, QueryRequest, QueryType, SymbolDataResult,
};
