//! Cache strategy definitions.
//!
//! This module defines [`CacheStrategy`], the declarative policy a caller attaches
//! to each cache request, and [`AdaptiveSignal`], the usage/volatility input for
//! the adaptive strategy.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How aggressively a cache request may be served from cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheStrategy {
    /// Short TTL for low-latency paths.
    StrongTimeliness,
    /// Longer TTL for analytical/query paths.
    #[default]
    WeakTimeliness,
    /// TTL follows the live trading state of the symbol's market.
    MarketAware,
    /// Always fetch, never store.
    NoCache,
    /// Baseline TTL scaled by observed volatility and usage.
    Adaptive,
}

impl CacheStrategy {
    /// Returns true if entries under this strategy are refreshed ahead of expiry.
    #[must_use]
    pub const fn refreshes_ahead(&self) -> bool {
        matches!(self, Self::MarketAware | Self::Adaptive)
    }

    /// Returns true if the resolver needs live market status for this strategy.
    #[must_use]
    pub const fn needs_market_status(&self) -> bool {
        matches!(self, Self::MarketAware)
    }

    /// Stable string form used in keys and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StrongTimeliness => "strong_timeliness",
            Self::WeakTimeliness => "weak_timeliness",
            Self::MarketAware => "market_aware",
            Self::NoCache => "no_cache",
            Self::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed usage and volatility for one cache key.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AdaptiveSignal {
    /// Caller-supplied volatility hint, 0.0 (flat) to 1.0 (very volatile).
    pub volatility: Option<f64>,
    /// Number of cache hits the key has served.
    pub hit_count: u64,
}
