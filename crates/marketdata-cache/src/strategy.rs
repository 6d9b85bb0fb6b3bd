//! Cache strategy resolution.
//!
//! [`StrategyResolver`] is a pure mapping from a [`CacheStrategy`] (plus live
//! market status and, for the adaptive strategy, a usage signal) to a TTL and an
//! optional refresh-ahead age.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use marketdata_core::{AdaptiveSignal, CacheConfig, CacheStrategy, MarketStatus};
use tracing::warn;

/// Hit count above which a key is considered hot.
const HOT_KEY_HITS: u64 = 50;

/// TTL and refresh policy for one cache write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedPolicy {
    /// Time-to-live of the entry. Zero means "do not store".
    pub ttl: Duration,
    /// Entry age after which a read schedules a background refresh.
    pub refresh_ahead: Option<Duration>,
}

/// Scales the adaptive baseline TTL.
pub trait AdaptiveTtlPolicy: Send + Sync + Debug {
    /// Returns the TTL for a key given the configured baseline and its signal.
    fn ttl(&self, base: Duration, signal: &AdaptiveSignal) -> Duration;
}

/// Default adaptive policy.
///
/// Volatile keys get up to 80% shorter TTLs. Hot keys get twice the TTL since
/// refresh-ahead keeps them warm anyway.
#[derive(Debug, Clone, Copy, Default)]
pub struct VolatilityScaledPolicy;

impl AdaptiveTtlPolicy for VolatilityScaledPolicy {
    fn ttl(&self, base: Duration, signal: &AdaptiveSignal) -> Duration {
        let mut factor = 1.0;
        if let Some(volatility) = signal.volatility.filter(|v| v.is_finite()) {
            factor *= 0.2 + 0.8 * (1.0 - volatility.clamp(0.0, 1.0));
        }
        if signal.hit_count >= HOT_KEY_HITS {
            factor *= 2.0;
        }
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }
}

/// Maps strategies to TTLs.
#[derive(Debug, Clone)]
pub struct StrategyResolver {
    config: CacheConfig,
    policy: Arc<dyn AdaptiveTtlPolicy>,
}

impl StrategyResolver {
    /// Creates a resolver using [`VolatilityScaledPolicy`] for adaptive entries.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self::with_policy(config, Arc::new(VolatilityScaledPolicy))
    }

    /// Creates a resolver with a custom adaptive policy.
    #[must_use]
    pub fn with_policy(config: CacheConfig, policy: Arc<dyn AdaptiveTtlPolicy>) -> Self {
        Self { config, policy }
    }

    /// Resolves the TTL and refresh-ahead age for a strategy.
    ///
    /// Never fails: a market-aware lookup without market status falls back to the
    /// configured conservative TTL.
    #[must_use]
    pub fn resolve(
        &self,
        strategy: CacheStrategy,
        market_status: Option<&MarketStatus>,
        signal: &AdaptiveSignal,
    ) -> ResolvedPolicy {
        let ttl = match strategy {
            CacheStrategy::StrongTimeliness => self.config.strong_ttl,
            CacheStrategy::WeakTimeliness => self.config.weak_ttl,
            CacheStrategy::NoCache => Duration::ZERO,
            CacheStrategy::MarketAware => match market_status {
                Some(status) if status.is_holiday => self.config.market_holiday_ttl,
                Some(status) if status.is_trading() => self.config.market_trading_ttl,
                Some(_) => self.config.market_closed_ttl,
                None => {
                    warn!(
                        fallback_ttl_ms = self.config.fallback_ttl.as_millis() as u64,
                        "Market status unknown, using fallback TTL"
                    );
                    self.config.fallback_ttl
                }
            },
            CacheStrategy::Adaptive => self
                .policy
                .ttl(self.config.adaptive_base_ttl, signal)
                .clamp(self.config.adaptive_min_ttl, self.config.adaptive_max_ttl),
        };

        let refresh_ahead = strategy
            .refreshes_ahead()
            .then(|| ttl.mul_f64(self.config.refresh_ahead_ratio));

        ResolvedPolicy { ttl, refresh_ahead }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> StrategyResolver {
        StrategyResolver::new(CacheConfig::default())
    }

    #[test]
    fn test_fixed_strategies() {
        let r = resolver();
        let signal = AdaptiveSignal::default();

        let strong = r.resolve(CacheStrategy::StrongTimeliness, None, &signal);
        assert_eq!(strong.ttl, Duration::from_secs(60));
        assert_eq!(strong.refresh_ahead, None);

        let weak = r.resolve(CacheStrategy::WeakTimeliness, None, &signal);
        assert_eq!(weak.ttl, Duration::from_secs(300));

        let none = r.resolve(CacheStrategy::NoCache, None, &signal);
        assert_eq!(none.ttl, Duration::ZERO);
    }

    #[test]
    fn test_market_aware_follows_trading_state() {
        let r = resolver();
        let signal = AdaptiveSignal::default();

        let trading = r.resolve(
            CacheStrategy::MarketAware,
            Some(&MarketStatus::trading()),
            &signal,
        );
        assert_eq!(trading.ttl, Duration::from_secs(60));
        assert_eq!(trading.refresh_ahead, Some(Duration::from_secs(48)));

        let holiday = r.resolve(
            CacheStrategy::MarketAware,
            Some(&MarketStatus::holiday()),
            &signal,
        );
        assert_eq!(holiday.ttl, Duration::from_secs(3600));

        let closed = r.resolve(
            CacheStrategy::MarketAware,
            Some(&MarketStatus::closed()),
            &signal,
        );
        assert_eq!(closed.ttl, Duration::from_secs(1800));
    }

    #[test]
    fn test_market_aware_unknown_status_falls_back() {
        let policy = resolver().resolve(CacheStrategy::MarketAware, None, &AdaptiveSignal::default());
        assert_eq!(policy.ttl, Duration::from_secs(300));
    }

    #[test]
    fn test_adaptive_scales_and_clamps() {
        let r = resolver();

        let calm = r.resolve(CacheStrategy::Adaptive, None, &AdaptiveSignal::default());
        assert_eq!(calm.ttl, Duration::from_secs(300));
        assert!(calm.refresh_ahead.is_some());

        let volatile = r.resolve(
            CacheStrategy::Adaptive,
            None,
            &AdaptiveSignal {
                volatility: Some(1.0),
                hit_count: 0,
            },
        );
        assert_eq!(volatile.ttl, Duration::from_secs(60));

        let nan = r.resolve(
            CacheStrategy::Adaptive,
            None,
            &AdaptiveSignal {
                volatility: Some(f64::NAN),
                hit_count: 0,
            },
        );
        assert_eq!(nan.ttl, Duration::from_secs(300));
    }

    #[derive(Debug)]
    struct Fixed(Duration);

    impl AdaptiveTtlPolicy for Fixed {
        fn ttl(&self, _base: Duration, _signal: &AdaptiveSignal) -> Duration {
            self.0
        }
    }

    #[test]
    fn test_custom_policy_is_clamped() {
        let r = StrategyResolver::with_policy(
            CacheConfig::default(),
            Arc::new(Fixed(Duration::from_secs(1))),
        );
        let policy = r.resolve(CacheStrategy::Adaptive, None, &AdaptiveSignal::default());
        assert_eq!(policy.ttl, Duration::from_secs(30));
    }
}
