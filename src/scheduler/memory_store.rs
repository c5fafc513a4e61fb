//! In-process task store.
//!
//! Same semantics as the Redis store, held behind a single mutex. Used for
//! single-node deployments without Redis and throughout the test suite.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::job::{ChatPayload, FailureOutcome, RetryPolicy, Task, TaskResult, TaskState};
use super::store::{
    select_expired, QueueError, QueueStats, RetentionPolicy, TaskStore, ORPHANED_REASON,
};

#[derive(Default)]
struct Inner {
    next_sequence: u64,
    tasks: HashMap<Uuid, Task>,
    waiting: BTreeMap<(Reverse<i32>, u64), Uuid>,
    delayed: BTreeSet<(DateTime<Utc>, Uuid)>,
    active: HashSet<Uuid>,
    completed: BTreeSet<(DateTime<Utc>, Uuid)>,
    failed: BTreeSet<(DateTime<Utc>, Uuid)>,
}

impl Inner {
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(&(eligible_at, id)) = self.delayed.first() {
            if eligible_at > now {
                break;
            }
            self.delayed.pop_first();
            if let Some(task) = self.tasks.get(&id) {
                self.waiting.insert(task.queue_rank(), id);
            }
        }
    }

    fn task_mut(&mut self, id: Uuid) -> Result<&mut Task, QueueError> {
        self.tasks.get_mut(&id).ok_or(QueueError::TaskNotFound(id))
    }

    /// Files a task under the index matching its (new) state.
    fn index(&mut self, id: Uuid) {
        let Some(task) = self.tasks.get(&id) else {
            return;
        };
        self.active.remove(&id);
        match &task.state {
            TaskState::Waiting { eligible_at: Some(at) } => {
                self.delayed.insert((*at, id));
            }
            TaskState::Waiting { eligible_at: None } => {
                self.waiting.insert(task.queue_rank(), id);
            }
            TaskState::Active { .. } => {
                self.active.insert(id);
            }
            TaskState::Completed { result } => {
                self.completed.insert((result.completed_at, id));
            }
            TaskState::Failed { failed_at, .. } => {
                self.failed.insert((*failed_at, id));
            }
        }
    }

    fn fail(&mut self, id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<FailureOutcome, QueueError> {
        let outcome = self.task_mut(id)?.fail(reason, now)?;
        self.index(id);
        Ok(outcome)
    }

    fn purge_set(
        set: &BTreeSet<(DateTime<Utc>, Uuid)>,
        max_age: std::time::Duration,
        max_count: Option<usize>,
        now: DateTime<Utc>,
        pinned: &HashSet<Uuid>,
    ) -> Vec<(DateTime<Utc>, Uuid)> {
        let entries: Vec<(i64, Uuid)> = set
            .iter()
            .map(|(at, id)| (at.timestamp_millis(), *id))
            .collect();
        let expired: HashSet<Uuid> =
            select_expired(&entries, max_age, max_count, now.timestamp_millis(), pinned)
                .into_iter()
                .collect();
        set.iter()
            .filter(|(_, id)| expired.contains(id))
            .copied()
            .collect()
    }
}

/// Task store kept in process memory.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: Mutex<Inner>,
}

impl MemoryTaskStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, QueueError> {
        self.inner
            .lock()
            .map_err(|_| QueueError::Unavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn enqueue(
        &self,
        payload: ChatPayload,
        priority: i32,
        retry: RetryPolicy,
    ) -> Result<Uuid, QueueError> {
        let mut inner = self.lock()?;
        inner.next_sequence += 1;

        let mut task = Task::new(payload, priority, retry);
        task.sequence = inner.next_sequence;
        let id = task.id;

        inner.waiting.insert(task.queue_rank(), id);
        inner.tasks.insert(id, task);
        Ok(id)
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<Task>, QueueError> {
        let now = Utc::now();
        let mut inner = self.lock()?;
        inner.promote_due(now);

        let Some((_, id)) = inner.waiting.pop_first() else {
            return Ok(None);
        };

        let task = inner.task_mut(id)?;
        task.claim(worker_id, now)?;
        let claimed = task.clone();
        inner.active.insert(id);
        Ok(Some(claimed))
    }

    async fn report_progress(&self, id: Uuid, percent: i32) -> Result<u8, QueueError> {
        let mut inner = self.lock()?;
        Ok(inner.task_mut(id)?.advance(percent)?)
    }

    async fn complete(&self, id: Uuid, result: TaskResult) -> Result<(), QueueError> {
        let mut inner = self.lock()?;
        inner.task_mut(id)?.complete(result)?;
        inner.index(id);
        Ok(())
    }

    async fn fail(&self, id: Uuid, reason: &str) -> Result<FailureOutcome, QueueError> {
        let mut inner = self.lock()?;
        inner.fail(id, reason, Utc::now())
    }

    async fn fail_permanently(&self, id: Uuid, reason: &str) -> Result<(), QueueError> {
        let mut inner = self.lock()?;
        inner.task_mut(id)?.fail_permanently(reason, Utc::now())?;
        inner.index(id);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, QueueError> {
        let inner = self.lock()?;
        Ok(inner.tasks.get(&id).cloned())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let inner = self.lock()?;
        Ok(QueueStats {
            waiting: inner.waiting.len() + inner.delayed.len(),
            active: inner.active.len(),
            completed: inner.completed.len(),
            failed: inner.failed.len(),
        })
    }

    async fn purge(
        &self,
        retention: &RetentionPolicy,
        pinned: &HashSet<Uuid>,
    ) -> Result<usize, QueueError> {
        let now = Utc::now();
        let mut inner = self.lock()?;

        let completed = Inner::purge_set(
            &inner.completed,
            retention.completed_max_age,
            retention.completed_max_count,
            now,
            pinned,
        );
        let failed = Inner::purge_set(
            &inner.failed,
            retention.failed_max_age,
            retention.failed_max_count,
            now,
            pinned,
        );

        for entry in &completed {
            inner.completed.remove(entry);
            inner.tasks.remove(&entry.1);
        }
        for entry in &failed {
            inner.failed.remove(entry);
            inner.tasks.remove(&entry.1);
        }
        Ok(completed.len() + failed.len())
    }

    async fn recover_orphans(&self) -> Result<usize, QueueError> {
        let now = Utc::now();
        let mut inner = self.lock()?;
        let orphans: Vec<Uuid> = inner.active.iter().copied().collect();
        for id in &orphans {
            inner.fail(*id, ORPHANED_REASON, now)?;
        }
        Ok(orphans.len())
    }
}
