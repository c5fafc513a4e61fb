//! Priority task queue with workers, retries and a start-rate limit.
//!
//! This module provides the execution side of the service:
//!
//! - **TaskStore**: durable task records and the ordered waiting set
//!   (`RedisTaskStore` for shared deployments, `MemoryTaskStore` in process)
//! - **WorkerPool**: fixed number of workers streaming answers from a
//!   generation backend
//! - **RateLimiter**: sliding-window limit on task starts shared by the pool
//! - **Task**: task definition with a tagged state machine and retry policy
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │  (API/CLI)   │
//!                      └──────┬───────┘
//!                             │ enqueue
//!                      ┌──────▼───────┐
//!                      │  TaskStore   │◄──── status polls
//!                      │ (Redis/mem)  │
//!                      └──────┬───────┘
//!                             │ claim (rate limited)
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └──────────── generation backend ───────┘
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic claim**: a task is handed to at most one worker at a time
//! - **Retry with backoff**: failed attempts wait `base * multiplier^(n-1)`
//! - **Crash recovery**: tasks left active by a dead process are retried
//! - **Graceful shutdown**: workers finish current tasks before stopping

pub mod job;
pub mod memory_store;
pub mod rate_limit;
pub mod redis_store;
pub mod store;
pub mod worker_pool;

pub use job::{
    validate_priority, ChatPayload, FailureOutcome, PayloadLimits, RetryPolicy, Task, TaskResult,
    TaskSnapshot, TaskState, TaskStatus, TransitionError, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY,
    PRIORITY_LIMIT,
};
pub use memory_store::MemoryTaskStore;
pub use rate_limit::RateLimiter;
pub use redis_store::RedisTaskStore;
pub use store::{QueueError, QueueStats, RetentionPolicy, TaskStore};
pub use worker_pool::{
    PoolError, PoolStats, PoolStatsHandle, Worker, WorkerPool, WorkerPoolConfig,
};
