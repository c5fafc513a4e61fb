//! Storage abstraction for the task queue.
//!
//! A [`TaskStore`] owns every task record and the ordered waiting set. All
//! state transitions go through it, so the at-most-one-claim guarantee holds
//! no matter how many workers (or processes) share the store.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::job::{ChatPayload, FailureOutcome, RetryPolicy, Task, TaskResult, TransitionError};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to the backing store.
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    /// The store could not be reached for an operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize task data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Task not found in the store.
    #[error("Task {0} not found")]
    TaskNotFound(Uuid),

    /// The requested transition is not legal from the task's current state.
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// Another process took the task over after this one's lease expired.
    #[error("Task {0} is no longer claimed by this process")]
    ClaimLost(Uuid),
}

impl QueueError {
    /// Returns whether the error means the store is unreachable, as opposed to
    /// a problem with a particular task.
    pub fn is_unavailable(&self) -> bool {
        match self {
            QueueError::ConnectionFailed(_) | QueueError::Unavailable(_) => true,
            QueueError::RedisError(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
            }
            _ => false,
        }
    }
}

/// Counts of tasks per lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Waiting tasks, including those delayed by a retry backoff.
    pub waiting: usize,
    /// Tasks currently claimed by a worker.
    pub active: usize,
    /// Retained completed tasks.
    pub completed: usize,
    /// Retained failed tasks.
    pub failed: usize,
}

impl QueueStats {
    /// Tasks still in flight (`waiting + active`).
    pub fn total(&self) -> usize {
        self.waiting + self.active
    }
}

/// How long finished tasks stay visible before the janitor purges them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Completed tasks older than this are purged.
    pub completed_max_age: Duration,
    /// At most this many completed tasks are kept (newest first).
    pub completed_max_count: Option<usize>,
    /// Failed tasks older than this are purged.
    pub failed_max_age: Duration,
    /// At most this many failed tasks are kept (newest first).
    pub failed_max_count: Option<usize>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed_max_age: Duration::from_secs(3600),
            completed_max_count: Some(100),
            failed_max_age: Duration::from_secs(86_400),
            failed_max_count: None,
        }
    }
}

/// Durable task storage shared by the API, the workers and the status hub.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Short store name used in logs.
    fn name(&self) -> &str;

    /// Stores a new waiting task and returns its id.
    ///
    /// The store assigns the enqueue sequence used for FIFO tie-breaking.
    async fn enqueue(
        &self,
        payload: ChatPayload,
        priority: i32,
        retry: RetryPolicy,
    ) -> Result<Uuid, QueueError>;

    /// Atomically claims the best eligible waiting task, if any.
    ///
    /// Delayed retries whose backoff has elapsed become eligible first.
    async fn claim_next(&self, worker_id: &str) -> Result<Option<Task>, QueueError>;

    /// Raises the progress of an active task and returns the stored value.
    async fn report_progress(&self, id: Uuid, percent: i32) -> Result<u8, QueueError>;

    /// Records the result of an active task.
    async fn complete(&self, id: Uuid, result: TaskResult) -> Result<(), QueueError>;

    /// Records a failed attempt; the task is retried while attempts remain.
    async fn fail(&self, id: Uuid, reason: &str) -> Result<FailureOutcome, QueueError>;

    /// Fails an active task without retrying.
    async fn fail_permanently(&self, id: Uuid, reason: &str) -> Result<(), QueueError>;

    /// Loads a task by id.
    async fn get(&self, id: Uuid) -> Result<Option<Task>, QueueError>;

    /// Counts tasks per state.
    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Deletes finished tasks past retention, sparing the pinned ids.
    ///
    /// Returns the number of tasks removed.
    async fn purge(
        &self,
        retention: &RetentionPolicy,
        pinned: &HashSet<Uuid>,
    ) -> Result<usize, QueueError>;

    /// Fails active tasks whose claiming process is gone.
    ///
    /// Recovered tasks are retried or failed like any other failed attempt.
    /// Stores without leases treat every active task as orphaned and are only
    /// swept at startup, before any worker claims.
    async fn recover_orphans(&self) -> Result<usize, QueueError>;

    /// How long this process's claims survive without a renewal.
    ///
    /// Stores shared between processes return `Some`; the worker pool then
    /// renews the lease and sweeps for orphans at a third of this period.
    fn lease_ttl(&self) -> Option<Duration> {
        None
    }

    /// Keeps this process's claims alive.
    async fn renew_lease(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Reason recorded for attempts interrupted by a process crash.
pub const ORPHANED_REASON: &str = "Worker stopped before the task finished";

/// Picks finished entries to purge.
///
/// `entries` are `(finished_at_ms, id)` sorted oldest first. An entry goes
/// when it is older than `max_age` or falls outside the newest `max_count`.
pub(crate) fn select_expired(
    entries: &[(i64, Uuid)],
    max_age: Duration,
    max_count: Option<usize>,
    now_ms: i64,
    pinned: &HashSet<Uuid>,
) -> Vec<Uuid> {
    let over_count = max_count
        .map(|max| entries.len().saturating_sub(max))
        .unwrap_or(0);
    let max_age_ms = max_age.as_millis() as i64;

    entries
        .iter()
        .enumerate()
        .filter(|(index, (finished_ms, _))| {
            *index < over_count || now_ms.saturating_sub(*finished_ms) >= max_age_ms
        })
        .map(|(_, (_, id))| *id)
        .filter(|id| !pinned.contains(id))
        .collect()
}
