//! Error types for market-data operations.
//!
//! This module defines [`DataError`] which covers all error cases that can occur
//! when fetching, caching, storing or sharding market data.

use thiserror::Error;

/// Errors that can occur during market-data operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    /// Network-related errors (connection failures, resets, etc.).
    #[error("Network error: {0}")]
    Network(String),

    /// Rate limit exceeded by an upstream provider.
    #[error("Rate limited by {provider}: retry after {retry_after:?}")]
    RateLimited {
        /// The provider that rate limited the request.
        provider: String,
        /// Suggested time to wait before retrying.
        retry_after: Option<std::time::Duration>,
    },

    /// The requested symbol was not found upstream.
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    /// The symbol was rejected before any I/O.
    #[error("Invalid symbol {symbol:?}: {reason}")]
    InvalidSymbol {
        /// The raw symbol as submitted.
        symbol: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An operation did not finish within its deadline.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Work was refused because the process is under memory pressure.
    #[error("Memory pressure: {0}")]
    MemoryPressure(String),

    /// Error interacting with the in-process cache.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Error interacting with the persistent storage collaborator.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A configuration value is invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The component is shutting down and refuses new work.
    #[error("Shutting down")]
    ShuttingDown,

    /// The requested feature is not supported.
    #[error("Feature not supported: {0}")]
    NotSupported(String),

    /// Any other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias using [`DataError`].
pub type Result<T> = std::result::Result<T, DataError>;
