//! Fire-and-forget metrics events.
//!
//! The engine reports what it does through a [`MetricsSink`]. Emitting never
//! blocks and never fails the caller; [`ChannelMetricsSink`] drops events when
//! its buffer is full and a separate consumer task drains the channel.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::{strategy::CacheStrategy, types::Market};

/// Something worth counting happened inside the engine.
#[derive(Clone, Debug, PartialEq)]
pub enum MetricsEvent {
    /// A cache lookup was served from cache.
    CacheHit {
        /// Cache key.
        key: String,
        /// Strategy of the request.
        strategy: CacheStrategy,
    },
    /// A cache lookup went to the upstream fetch path.
    CacheMiss {
        /// Cache key.
        key: String,
        /// Strategy of the request.
        strategy: CacheStrategy,
        /// Whether the fetch succeeded.
        fetched: bool,
    },
    /// A background refresh task finished.
    RefreshCompleted {
        /// Cache key.
        key: String,
        /// Whether the refresh succeeded.
        success: bool,
        /// Number of attempts made.
        attempts: u32,
    },
    /// A memory check classified pressure above normal.
    MemoryPressure {
        /// Sampled usage in percent.
        usage_percent: f64,
        /// Whether the batch was deferred entirely.
        deferred: bool,
    },
    /// A market shard did not finish in time.
    ShardTimedOut {
        /// Market of the shard.
        market: Market,
        /// Symbols in the shard.
        symbols: usize,
    },
    /// A top-level query finished.
    QueryCompleted {
        /// Query identifier.
        query_id: String,
        /// Validated symbols in the request.
        symbols: usize,
        /// Successful results.
        results: usize,
        /// Failed symbols.
        errors: usize,
        /// Wall time spent.
        elapsed: Duration,
    },
}

/// Non-blocking sink for [`MetricsEvent`]s.
pub trait MetricsSink: Send + Sync + Debug {
    /// Records an event. Must not block.
    fn emit(&self, event: MetricsEvent);
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn emit(&self, event: MetricsEvent) {
        trace!(?event, "NoopMetricsSink: dropping event");
    }
}

/// Sink backed by a bounded channel.
#[derive(Debug)]
pub struct ChannelMetricsSink {
    tx: mpsc::Sender<MetricsEvent>,
    dropped: AtomicU64,
}

impl ChannelMetricsSink {
    /// Creates a sink and the receiving half of its channel.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MetricsEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Number of events dropped because the buffer was full or closed.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl MetricsSink for ChannelMetricsSink {
    fn emit(&self, event: MetricsEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Spawns a task that drains `rx` and logs every event at debug level.
///
/// The task ends when every sender is dropped.
pub fn spawn_metrics_logger(mut rx: mpsc::Receiver<MetricsEvent>) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut seen = 0u64;
        while let Some(event) = rx.recv().await {
            seen += 1;
            debug!(target: "marketdata::metrics", ?event, "metrics event");
        }
        seen
    })
}
