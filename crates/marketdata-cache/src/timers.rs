//! Managed set of periodic and long-running tasks.
//!
//! Every timer the orchestrator owns is spawned through a [`TimerSet`], so a
//! single [`TimerSet::cancel_all`] is guaranteed to stop all of them.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Owns cancellation handles for spawned timers.
#[derive(Debug, Default)]
pub struct TimerSet {
    token: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl TimerSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `tick` every `period`, first run one period from now.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.child_token();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            debug!(timer = name, "Timer stopped");
        });
        self.handles.push((name, handle));
    }

    /// Spawns a long-running task that stops when the set is cancelled.
    pub fn spawn_task<Fut>(&mut self, name: &'static str, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.child_token();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = task => {}
            }
            debug!(timer = name, "Task stopped");
        });
        self.handles.push((name, handle));
    }

    /// Number of tracked timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns true if no timers are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Returns true once [`TimerSet::cancel_all`] has run.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancels and aborts every timer, returning how many were tracked.
    ///
    /// Timers spawned afterwards stop immediately.
    pub fn cancel_all(&mut self) -> usize {
        self.token.cancel();
        let count = self.handles.len();
        for (name, handle) in self.handles.drain(..) {
            handle.abort();
            debug!(timer = name, "Timer cancelled");
        }
        count
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_periodic_timer_runs_until_cancelled() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut timers = TimerSet::new();

        let counter = Arc::clone(&ticks);
        timers.spawn_periodic("count", Duration::from_millis(100), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        assert_eq!(timers.cancel_all(), 1);
        assert!(timers.is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_spawned_after_cancel_stops_immediately() {
        let mut timers = TimerSet::new();
        timers.cancel_all();

        let ran = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&ran);
        timers.spawn_task("late", async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            flag.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(timers.is_cancelled());
    }
}
