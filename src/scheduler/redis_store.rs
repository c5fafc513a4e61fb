//! Redis-backed task store.
//!
//! # Key Layout
//!
//! For a queue named `q`:
//!
//! - `q:task:{id}`: task record as JSON
//! - `q:waiting`: sorted set of claimable ids, scored by rank (lowest first)
//! - `q:delayed`: sorted set of retrying ids, scored by eligibility time (ms)
//! - `q:active`: set of claimed ids
//! - `q:owner`: hash of active id to the claiming process
//! - `q:lease:{owner}`: expiring key held while that process is alive
//! - `q:completed`, `q:failed`: sorted sets scored by finish time (ms)
//! - `q:rank`: hash of id to rank score, used to re-queue delayed ids
//! - `q:seq`: enqueue counter
//!
//! # Reliability
//!
//! A claim reads the head of the waiting set, builds the active record, and
//! commits both in one script that only succeeds if the head and its record
//! are unchanged. The index, the record and the owner therefore always move
//! together, and two workers (in this or another process) can never claim
//! the same task.
//!
//! Every later write to a claimed task checks the owner first. Active ids
//! whose owner's lease has expired are taken over and failed by
//! `recover_orphans`; ids owned by a live process are left alone.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::job::{ChatPayload, FailureOutcome, RetryPolicy, Task, TaskResult, TaskState};
use super::store::{
    select_expired, QueueError, QueueStats, RetentionPolicy, TaskStore, ORPHANED_REASON,
};

/// How long claims survive without a renewal.
pub const LEASE_TTL: Duration = Duration::from_secs(30);

/// Lost commit races tolerated per claim before reporting an empty queue.
const CLAIM_RACE_LIMIT: usize = 8;

/// KEYS: waiting, delayed, rank. ARGV: now_ms, task key prefix.
///
/// Promotes due retries, then returns `{id, record}` for the head of the
/// waiting set, `{id}` when the record is missing, or nil when empty.
const PEEK_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
  local rank = redis.call('HGET', KEYS[3], id)
  if rank then
    redis.call('ZADD', KEYS[1], rank, id)
  end
  redis.call('ZREM', KEYS[2], id)
end
local head = redis.call('ZRANGE', KEYS[1], 0, 0)
if head[1] == nil then
  return false
end
local record = redis.call('GET', ARGV[2] .. head[1])
if not record then
  return {head[1]}
end
return {head[1], record}
"#;

/// KEYS: waiting, active, owner, task, lease.
/// ARGV: id, peeked record, claimed record, owner, lease ttl ms.
const COMMIT_CLAIM_SCRIPT: &str = r#"
local head = redis.call('ZRANGE', KEYS[1], 0, 0)
if head[1] ~= ARGV[1] then
  return 0
end
if redis.call('GET', KEYS[4]) ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('SADD', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[4])
redis.call('SET', KEYS[4], ARGV[3])
redis.call('SET', KEYS[5], '1', 'PX', ARGV[5])
return 1
"#;

/// KEYS: task, owner. ARGV: id, owner, record.
const WRITE_OWNED_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
"#;

/// KEYS: task, active, owner, rank, target index.
/// ARGV: id, owner, record, score, forget rank ('1' or '0').
const SETTLE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3])
redis.call('SREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('ZADD', KEYS[5], ARGV[4], ARGV[1])
if ARGV[5] == '1' then
  redis.call('HDEL', KEYS[4], ARGV[1])
end
return 1
"#;

/// KEYS: owner, own lease. ARGV: id, lease key prefix, owner, lease ttl ms.
///
/// Takes an active id over when its owner's lease is gone.
const TAKEOVER_SCRIPT: &str = r#"
local holder = redis.call('HGET', KEYS[1], ARGV[1])
if holder and redis.call('EXISTS', ARGV[2] .. holder) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
redis.call('SET', KEYS[2], '1', 'PX', ARGV[4])
return 1
"#;

struct Keys {
    prefix: String,
    task_prefix: String,
    lease_prefix: String,
    waiting: String,
    delayed: String,
    active: String,
    owner: String,
    completed: String,
    failed: String,
    rank: String,
    sequence: String,
}

impl Keys {
    fn new(queue_name: &str) -> Self {
        Self {
            prefix: queue_name.to_string(),
            task_prefix: format!("{}:task:", queue_name),
            lease_prefix: format!("{}:lease:", queue_name),
            waiting: format!("{}:waiting", queue_name),
            delayed: format!("{}:delayed", queue_name),
            active: format!("{}:active", queue_name),
            owner: format!("{}:owner", queue_name),
            completed: format!("{}:completed", queue_name),
            failed: format!("{}:failed", queue_name),
            rank: format!("{}:rank", queue_name),
            sequence: format!("{}:seq", queue_name),
        }
    }

    fn task(&self, id: Uuid) -> String {
        format!("{}{}", self.task_prefix, id)
    }

    fn lease(&self, owner: &str) -> String {
        format!("{}{}", self.lease_prefix, owner)
    }
}

struct Scripts {
    peek: Script,
    commit_claim: Script,
    write_owned: Script,
    settle: Script,
    takeover: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            peek: Script::new(PEEK_SCRIPT),
            commit_claim: Script::new(COMMIT_CLAIM_SCRIPT),
            write_owned: Script::new(WRITE_OWNED_SCRIPT),
            settle: Script::new(SETTLE_SCRIPT),
            takeover: Script::new(TAKEOVER_SCRIPT),
        }
    }
}

/// Task store shared through Redis.
pub struct RedisTaskStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    keys: Keys,
    scripts: Scripts,
    /// Identity of this store instance in `q:owner` and its lease key.
    owner: String,
}

impl RedisTaskStore {
    /// Connects to Redis and creates a store for the named queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, queue_name))
    }

    /// Creates a store from an existing ConnectionManager.
    ///
    /// Each store gets a fresh owner identity, so two stores on one queue
    /// behave like two processes.
    pub fn from_connection(redis: ConnectionManager, queue_name: &str) -> Self {
        Self {
            redis,
            keys: Keys::new(queue_name),
            scripts: Scripts::new(),
            owner: Uuid::new_v4().to_string(),
        }
    }

    /// Returns the queue name.
    pub fn queue_name(&self) -> &str {
        &self.keys.prefix
    }

    /// Returns the identity this store claims tasks under.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn lease_ttl_ms(&self) -> u64 {
        LEASE_TTL.as_millis() as u64
    }

    async fn load(&self, id: Uuid) -> Result<Option<Task>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.get(self.keys.task(id)).await?;
        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn load_existing(&self, id: Uuid) -> Result<Task, QueueError> {
        self.load(id).await?.ok_or(QueueError::TaskNotFound(id))
    }

    /// Removes a waiting id that cannot be claimed.
    async fn drop_waiting(&self, raw_id: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrem(&self.keys.waiting, raw_id)
            .ignore()
            .hdel(&self.keys.rank, raw_id)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Rewrites an active record, provided this store still owns it.
    async fn write_owned(&self, task: &Task) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let written: i32 = self
            .scripts
            .write_owned
            .key(self.keys.task(task.id))
            .key(&self.keys.owner)
            .arg(task.id.to_string())
            .arg(&self.owner)
            .arg(serde_json::to_string(task)?)
            .invoke_async(&mut conn)
            .await?;
        if written == 1 {
            Ok(())
        } else {
            Err(QueueError::ClaimLost(task.id))
        }
    }

    /// Writes the task record, releases ownership and moves its id out of
    /// the active set into the index matching its new state, atomically.
    async fn settle(&self, task: &Task) -> Result<(), QueueError> {
        let (index, score, forget_rank) = match &task.state {
            TaskState::Waiting { eligible_at } => (
                &self.keys.delayed,
                eligible_at.unwrap_or_else(Utc::now).timestamp_millis(),
                false,
            ),
            TaskState::Completed { result } => (
                &self.keys.completed,
                result.completed_at.timestamp_millis(),
                true,
            ),
            TaskState::Failed { failed_at, .. } => {
                (&self.keys.failed, failed_at.timestamp_millis(), true)
            }
            TaskState::Active { .. } => return self.write_owned(task).await,
        };

        let mut conn = self.redis.clone();
        let settled: i32 = self
            .scripts
            .settle
            .key(self.keys.task(task.id))
            .key(&self.keys.active)
            .key(&self.keys.owner)
            .key(&self.keys.rank)
            .key(index)
            .arg(task.id.to_string())
            .arg(&self.owner)
            .arg(serde_json::to_string(task)?)
            .arg(score)
            .arg(if forget_rank { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        if settled == 1 {
            Ok(())
        } else {
            Err(QueueError::ClaimLost(task.id))
        }
    }

    /// Takes over an active id whose owner is gone; `false` if it is alive.
    async fn take_over(&self, raw_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let taken: i32 = self
            .scripts
            .takeover
            .key(&self.keys.owner)
            .key(self.keys.lease(&self.owner))
            .arg(raw_id)
            .arg(&self.keys.lease_prefix)
            .arg(&self.owner)
            .arg(self.lease_ttl_ms())
            .invoke_async(&mut conn)
            .await?;
        Ok(taken == 1)
    }

    async fn finished_entries(&self, key: &str) -> Result<Vec<(i64, Uuid)>, QueueError> {
        let mut conn = self.redis.clone();
        let raw: Vec<(String, f64)> = conn.zrange_withscores(key, 0, -1).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(id, score)| Uuid::parse_str(&id).ok().map(|id| (score as i64, id)))
            .collect())
    }

    async fn delete_finished(&self, key: &str, ids: &[Uuid]) -> Result<(), QueueError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in ids {
            pipe.zrem(key, id.to_string())
                .ignore()
                .del(self.keys.task(*id))
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for RedisTaskStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn enqueue(
        &self,
        payload: ChatPayload,
        priority: i32,
        retry: RetryPolicy,
    ) -> Result<Uuid, QueueError> {
        let mut conn = self.redis.clone();
        let sequence: u64 = conn.incr(&self.keys.sequence, 1).await?;

        let mut task = Task::new(payload, priority, retry);
        task.sequence = sequence;
        let id = task.id.to_string();
        let rank = task.rank_score();
        let serialized = serde_json::to_string(&task)?;

        // Record first, then index, so a claimed id always has a record.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.keys.task(task.id), serialized)
            .ignore()
            .hset(&self.keys.rank, &id, rank)
            .ignore()
            .zadd(&self.keys.waiting, &id, rank)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(task.id)
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<Task>, QueueError> {
        let mut conn = self.redis.clone();

        for _ in 0..CLAIM_RACE_LIMIT {
            let now = Utc::now();
            let peeked: Option<Vec<String>> = self
                .scripts
                .peek
                .key(&self.keys.waiting)
                .key(&self.keys.delayed)
                .key(&self.keys.rank)
                .arg(now.timestamp_millis())
                .arg(&self.keys.task_prefix)
                .invoke_async(&mut conn)
                .await?;

            let Some(peeked) = peeked else {
                return Ok(None);
            };
            let mut parts = peeked.into_iter();
            let Some(raw_id) = parts.next() else {
                return Ok(None);
            };
            let (Ok(id), Some(record)) = (Uuid::parse_str(&raw_id), parts.next()) else {
                warn!(task_id = %raw_id, "Waiting id has no usable record; dropping it");
                self.drop_waiting(&raw_id).await?;
                continue;
            };

            let mut task: Task = serde_json::from_str(&record)?;
            task.claim(worker_id, now)?;

            let committed: i32 = self
                .scripts
                .commit_claim
                .key(&self.keys.waiting)
                .key(&self.keys.active)
                .key(&self.keys.owner)
                .key(self.keys.task(id))
                .key(self.keys.lease(&self.owner))
                .arg(&raw_id)
                .arg(&record)
                .arg(serde_json::to_string(&task)?)
                .arg(&self.owner)
                .arg(self.lease_ttl_ms())
                .invoke_async(&mut conn)
                .await?;
            if committed == 1 {
                return Ok(Some(task));
            }
            debug!(task_id = %id, worker_id = worker_id, "Lost claim race, retrying");
        }

        Ok(None)
    }

    async fn report_progress(&self, id: Uuid, percent: i32) -> Result<u8, QueueError> {
        let mut task = self.load_existing(id).await?;
        let before = task.progress();
        let progress = task.advance(percent)?;
        if progress != before {
            self.write_owned(&task).await?;
        }
        Ok(progress)
    }

    async fn complete(&self, id: Uuid, result: TaskResult) -> Result<(), QueueError> {
        let mut task = self.load_existing(id).await?;
        task.complete(result)?;
        self.settle(&task).await
    }

    async fn fail(&self, id: Uuid, reason: &str) -> Result<FailureOutcome, QueueError> {
        let mut task = self.load_existing(id).await?;
        let outcome = task.fail(reason, Utc::now())?;
        self.settle(&task).await?;
        Ok(outcome)
    }

    async fn fail_permanently(&self, id: Uuid, reason: &str) -> Result<(), QueueError> {
        let mut task = self.load_existing(id).await?;
        task.fail_permanently(reason, Utc::now())?;
        self.settle(&task).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, QueueError> {
        self.load(id).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();
        let (waiting, delayed, active, completed, failed): (usize, usize, usize, usize, usize) =
            redis::pipe()
                .zcard(&self.keys.waiting)
                .zcard(&self.keys.delayed)
                .scard(&self.keys.active)
                .zcard(&self.keys.completed)
                .zcard(&self.keys.failed)
                .query_async(&mut conn)
                .await?;

        Ok(QueueStats {
            waiting: waiting + delayed,
            active,
            completed,
            failed,
        })
    }

    async fn purge(
        &self,
        retention: &RetentionPolicy,
        pinned: &HashSet<Uuid>,
    ) -> Result<usize, QueueError> {
        let now_ms = Utc::now().timestamp_millis();

        let completed = select_expired(
            &self.finished_entries(&self.keys.completed).await?,
            retention.completed_max_age,
            retention.completed_max_count,
            now_ms,
            pinned,
        );
        self.delete_finished(&self.keys.completed, &completed).await?;

        let failed = select_expired(
            &self.finished_entries(&self.keys.failed).await?,
            retention.failed_max_age,
            retention.failed_max_count,
            now_ms,
            pinned,
        );
        self.delete_finished(&self.keys.failed, &failed).await?;

        Ok(completed.len() + failed.len())
    }

    async fn recover_orphans(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = conn.smembers(&self.keys.active).await?;
        let mut recovered = 0;

        for raw_id in members {
            if !self.take_over(&raw_id).await? {
                continue;
            }

            let task = match Uuid::parse_str(&raw_id) {
                Ok(id) => self.load(id).await?,
                Err(_) => None,
            };

            match task {
                Some(mut task) if matches!(task.state, TaskState::Active { .. }) => {
                    let outcome = task.fail(ORPHANED_REASON, Utc::now())?;
                    self.settle(&task).await?;
                    info!(task_id = %task.id, ?outcome, "Recovered orphaned task");
                    recovered += 1;
                }
                Some(task) => {
                    // Record already settled; only the index is stale.
                    self.settle(&task).await?;
                }
                None => {
                    let mut pipe = redis::pipe();
                    pipe.atomic()
                        .srem(&self.keys.active, &raw_id)
                        .ignore()
                        .hdel(&self.keys.owner, &raw_id)
                        .ignore();
                    pipe.query_async::<_, ()>(&mut conn).await?;
                }
            }
        }

        Ok(recovered)
    }

    fn lease_ttl(&self) -> Option<Duration> {
        Some(LEASE_TTL)
    }

    async fn renew_lease(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.pset_ex::<_, _, ()>(self.keys.lease(&self.owner), 1, self.lease_ttl_ms())
            .await?;
        Ok(())
    }
}
