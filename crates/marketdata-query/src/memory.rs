//! Memory pressure monitor.
//!
//! [`MemoryPressureMonitor::check_before_batch`] takes one fresh
//! [`MemorySample`] per call and turns it into an admission decision. The
//! monitor fails open: a sampler error never blocks a batch.

use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use marketdata_core::{DataError, MemoryConfig, Result};
use serde::Serialize;
use tracing::{debug, warn};

/// One reading of memory usage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemorySample {
    /// Bytes in use.
    pub used_bytes: u64,
    /// Bytes available in total.
    pub total_bytes: u64,
}

impl MemorySample {
    /// Used fraction in `[0, 1]`, or `None` for an empty total.
    #[must_use]
    pub fn usage(&self) -> Option<f64> {
        (self.total_bytes > 0)
            .then(|| (self.used_bytes as f64 / self.total_bytes as f64).clamp(0.0, 1.0))
    }
}

/// Source of memory readings.
pub trait MemorySampler: Send + Sync + Debug {
    /// Takes a reading.
    fn sample(&self) -> Result<MemorySample>;
}

/// Reads system memory from `/proc/meminfo` (Linux).
#[derive(Debug, Clone)]
pub struct ProcMemorySampler {
    path: PathBuf,
}

impl Default for ProcMemorySampler {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/proc/meminfo"),
        }
    }
}

impl ProcMemorySampler {
    /// Sampler over the standard `/proc/meminfo`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sampler over a file in `/proc/meminfo` format.
    #[must_use]
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MemorySampler for ProcMemorySampler {
    fn sample(&self) -> Result<MemorySample> {
        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| DataError::Other(format!("{}: {e}", self.path.display())))?;
        parse_meminfo(&text)
    }
}

/// Parses `MemTotal` and `MemAvailable` (in kB) out of `/proc/meminfo` text.
///
/// # Errors
/// Returns [`DataError::Other`] if either field is missing or malformed.
pub fn parse_meminfo(text: &str) -> Result<MemorySample> {
    let field = |name: &str| -> Result<u64> {
        text.lines()
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
            .and_then(|rest| rest.split_whitespace().next()?.parse::<u64>().ok())
            .map(|kb| kb.saturating_mul(1024))
            .ok_or_else(|| DataError::Other(format!("meminfo: missing or malformed {name}")))
    };
    let total_bytes = field("MemTotal")?;
    let available = field("MemAvailable")?;
    Ok(MemorySample {
        used_bytes: total_bytes.saturating_sub(available),
        total_bytes,
    })
}

/// Discrete pressure classification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum PressureLevel {
    /// Below the warning threshold.
    #[default]
    Normal,
    /// Between the warning and critical thresholds.
    Warning,
    /// At or above the critical threshold.
    Critical,
}

/// What the caller should do with the batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum Recommendation {
    /// Run the whole batch.
    #[default]
    Proceed,
    /// Run at most `suggested_batch_size` symbols.
    ReduceBatch,
    /// Run nothing.
    Defer,
}

/// Result of one pre-batch check.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct MemoryCheckResult {
    /// Sampled usage in percent. Zero when sampling failed or is disabled.
    pub current_usage_percent: f64,
    /// Pressure classification.
    pub pressure_level: PressureLevel,
    /// Admission decision.
    pub recommendation: Recommendation,
    /// False only when the batch must be deferred.
    pub can_process: bool,
    /// Batch size to use under [`Recommendation::ReduceBatch`].
    pub suggested_batch_size: Option<usize>,
}

impl MemoryCheckResult {
    fn proceed(current_usage_percent: f64) -> Self {
        Self {
            current_usage_percent,
            pressure_level: PressureLevel::Normal,
            recommendation: Recommendation::Proceed,
            can_process: true,
            suggested_batch_size: None,
        }
    }
}

/// Classifies memory usage against configured thresholds.
#[derive(Debug, Clone)]
pub struct MemoryPressureMonitor {
    config: MemoryConfig,
    sampler: Arc<dyn MemorySampler>,
}

impl MemoryPressureMonitor {
    /// Creates a monitor.
    ///
    /// # Errors
    /// Returns [`DataError::InvalidConfig`] unless `0 < warning < critical <= 1`.
    pub fn new(config: MemoryConfig, sampler: Arc<dyn MemorySampler>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, sampler })
    }

    /// Creates a monitor over `/proc/meminfo`.
    ///
    /// # Errors
    /// Returns [`DataError::InvalidConfig`] for invalid thresholds.
    pub fn system(config: MemoryConfig) -> Result<Self> {
        Self::new(config, Arc::new(ProcMemorySampler::new()))
    }

    /// Samples memory once and decides how much of a `symbol_count` batch may run.
    pub fn check_before_batch(&self, symbol_count: usize) -> MemoryCheckResult {
        if !self.config.enabled || symbol_count == 0 {
            return MemoryCheckResult::proceed(0.0);
        }

        let usage = match self.sampler.sample().map(|s| s.usage()) {
            Ok(Some(usage)) => usage,
            Ok(None) => {
                warn!("Memory sample reported zero total, proceeding");
                return MemoryCheckResult::proceed(0.0);
            }
            Err(e) => {
                warn!(error = %e, "Memory sampling failed, proceeding");
                return MemoryCheckResult::proceed(0.0);
            }
        };
        let percent = usage * 100.0;
        let MemoryConfig {
            warning_threshold: warning,
            critical_threshold: critical,
            reduction_factor,
            ..
        } = self.config;

        if usage >= critical {
            warn!(usage_percent = percent, symbol_count, "Critical memory pressure, deferring batch");
            return MemoryCheckResult {
                current_usage_percent: percent,
                pressure_level: PressureLevel::Critical,
                recommendation: Recommendation::Defer,
                can_process: false,
                suggested_batch_size: None,
            };
        }

        if usage >= warning {
            let pressure_ratio = (usage - warning) / (critical - warning);
            let raw = (symbol_count as f64 * reduction_factor * (1.0 - pressure_ratio)).floor();
            let suggested = (raw.max(0.0) as usize).clamp(1, symbol_count);
            debug!(
                usage_percent = percent,
                symbol_count, suggested, "Memory pressure, reducing batch"
            );
            return MemoryCheckResult {
                current_usage_percent: percent,
                pressure_level: PressureLevel::Warning,
                recommendation: Recommendation::ReduceBatch,
                can_process: true,
                suggested_batch_size: Some(suggested),
            };
        }

        MemoryCheckResult::proceed(percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Fixed(f64);

    impl MemorySampler for Fixed {
        fn sample(&self) -> Result<MemorySample> {
            Ok(MemorySample {
                used_bytes: (self.0 * 1000.0) as u64,
                total_bytes: 1000,
            })
        }
    }

    #[derive(Debug)]
    struct Broken;

    impl MemorySampler for Broken {
        fn sample(&self) -> Result<MemorySample> {
            Err(DataError::Other("no meminfo".into()))
        }
    }

    fn monitor(usage: f64) -> MemoryPressureMonitor {
        MemoryPressureMonitor::new(MemoryConfig::default(), Arc::new(Fixed(usage))).unwrap()
    }

    #[test]
    fn test_critical_usage_defers() {
        let check = monitor(0.95).check_before_batch(100);
        assert_eq!(check.recommendation, Recommendation::Defer);
        assert_eq!(check.pressure_level, PressureLevel::Critical);
        assert!(!check.can_process);
    }

    #[test]
    fn test_warning_usage_reduces_batch() {
        let check = monitor(0.80).check_before_batch(100);
        assert_eq!(check.recommendation, Recommendation::ReduceBatch);
        assert!(check.can_process);
        let suggested = check.suggested_batch_size.unwrap();
        assert!(suggested < 100);
        assert!(suggested >= 1);
        // 100 * 0.5 * (1 - 1/3)
        assert_eq!(suggested, 33);
    }

    #[test]
    fn test_suggestion_never_below_one() {
        let check = monitor(0.899).check_before_batch(3);
        assert_eq!(check.recommendation, Recommendation::ReduceBatch);
        assert_eq!(check.suggested_batch_size, Some(1));
    }

    #[test]
    fn test_normal_usage_proceeds() {
        let check = monitor(0.50).check_before_batch(100);
        assert_eq!(check.recommendation, Recommendation::Proceed);
        assert_eq!(check.pressure_level, PressureLevel::Normal);
        assert_eq!(check.current_usage_percent, 50.0);
    }

    #[test]
    fn test_sampler_error_fails_open() {
        let monitor =
            MemoryPressureMonitor::new(MemoryConfig::default(), Arc::new(Broken)).unwrap();
        let check = monitor.check_before_batch(100);
        assert_eq!(check.recommendation, Recommendation::Proceed);
        assert!(check.can_process);
        assert_eq!(check.current_usage_percent, 0.0);
    }

    #[test]
    fn test_disabled_monitor_never_samples() {
        let config = MemoryConfig {
            enabled: false,
            ..Default::default()
        };
        let monitor = MemoryPressureMonitor::new(config, Arc::new(Fixed(0.99))).unwrap();
        assert_eq!(
            monitor.check_before_batch(10).recommendation,
            Recommendation::Proceed
        );
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let config = MemoryConfig {
            warning_threshold: 0.9,
            critical_threshold: 0.9,
            ..Default::default()
        };
        assert!(MemoryPressureMonitor::new(config, Arc::new(Fixed(0.1))).is_err());
    }

    #[test]
    fn test_parse_meminfo() {
        let text = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    4000000 kB\n";
        let sample = parse_meminfo(text).unwrap();
        assert_eq!(sample.total_bytes, 16_000_000 * 1024);
        assert_eq!(sample.used_bytes, 12_000_000 * 1024);
        assert_eq!(sample.usage(), Some(0.75));

        assert!(parse_meminfo("MemTotal: 10 kB\n").is_err());
    }
}
