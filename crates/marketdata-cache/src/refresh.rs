//! Background refresh task bookkeeping.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;

use crate::orchestrator::CacheRequest;

/// Scheduling priority of a refresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RefreshPriority {
    /// Closed markets and cold keys.
    Low,
    /// Default.
    Normal,
    /// Trading markets and hot keys.
    High,
}

/// Lifecycle of a refresh task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefreshStatus {
    /// Waiting for a worker slot.
    Queued,
    /// Running on a worker.
    Running,
    /// Finished and the entry was overwritten.
    Done,
    /// Gave up after its attempts.
    Failed,
}

/// A scheduled re-fetch of one cache key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackgroundRefreshTask {
    /// Unique id; distinguishes a re-scheduled key from an invalidated one.
    pub id: u64,
    /// Cache key to refresh.
    pub key: String,
    /// Scheduling priority.
    pub priority: RefreshPriority,
    /// Schedule time in milliseconds since the Unix epoch.
    pub scheduled_at: i64,
    /// Current status.
    pub status: RefreshStatus,
}

/// A queued task together with the request whose data flow it re-runs.
pub(crate) struct QueuedRefresh {
    pub(crate) task: BackgroundRefreshTask,
    pub(crate) request: CacheRequest,
}

impl fmt::Debug for QueuedRefresh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedRefresh")
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

impl PartialEq for QueuedRefresh {
    fn eq(&self, other: &Self) -> bool {
        self.task.id == other.task.id
    }
}

impl Eq for QueuedRefresh {}

impl PartialOrd for QueuedRefresh {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRefresh {
    // Highest priority first, then oldest first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.task.id.cmp(&self.task.id))
    }
}

/// Queue plus the authoritative task registry, one record per key.
#[derive(Debug, Default)]
pub(crate) struct RefreshState {
    pub(crate) queue: BinaryHeap<QueuedRefresh>,
    pub(crate) tasks: HashMap<String, BackgroundRefreshTask>,
    next_id: u64,
}

impl RefreshState {
    /// Enqueues a refresh unless one is already registered for the key.
    pub(crate) fn enqueue(
        &mut self,
        request: CacheRequest,
        key: String,
        priority: RefreshPriority,
        now: i64,
    ) -> Option<u64> {
        if self.tasks.contains_key(&key) {
            return None;
        }
        self.next_id += 1;
        let task = BackgroundRefreshTask {
            id: self.next_id,
            key: key.clone(),
            priority,
            scheduled_at: now,
            status: RefreshStatus::Queued,
        };
        self.tasks.insert(key, task.clone());
        self.queue.push(QueuedRefresh { task, request });
        Some(self.next_id)
    }

    /// Pops the next task and marks it running.
    pub(crate) fn start_next(&mut self) -> Option<QueuedRefresh> {
        let mut next = self.queue.pop()?;
        next.task.status = RefreshStatus::Running;
        if let Some(record) = self.tasks.get_mut(&next.task.key) {
            record.status = RefreshStatus::Running;
        }
        Some(next)
    }

    /// Removes the record for a finished task if it still owns its key.
    pub(crate) fn finish(&mut self, key: &str, id: u64) -> bool {
        match self.tasks.get(key) {
            Some(record) if record.id == id => {
                self.tasks.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Forgets a key, dropping a queued task for it.
    pub(crate) fn forget(&mut self, key: &str) -> bool {
        self.queue.retain(|q| q.task.key != key);
        self.tasks.remove(key).is_some()
    }

    /// Drops every queued (not yet running) task, returning their keys.
    pub(crate) fn drain_queued(&mut self) -> Vec<String> {
        let keys: Vec<String> = self.queue.drain().map(|q| q.task.key).collect();
        for key in &keys {
            self.tasks.remove(key);
        }
        keys
    }

    pub(crate) fn running(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == RefreshStatus::Running)
            .count()
    }
}
