//! chat-queue: queue-backed chat generation service.
//!
//! Prompts are stored as prioritized tasks, answered by a rate-limited pool
//! of workers streaming from a generation backend, and observed through
//! polling status streams.

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod scheduler;
pub mod service;
pub mod status;

pub use api::{ApiError, QueueApi, StatsResponse, SubmitRequest, SubmitResponse};
pub use config::ServiceConfig;
pub use error::{LlmError, ValidationError};
pub use scheduler::{
    MemoryTaskStore, QueueError, RedisTaskStore, Task, TaskSnapshot, TaskStatus, TaskStore,
    WorkerPool, WorkerPoolConfig,
};
pub use service::{ChatQueueService, ServiceError};
pub use status::{StatusEvent, StatusHub};
