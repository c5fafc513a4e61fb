//! Queue API surface: submit, status, stats and subscriptions.
//!
//! Transport-agnostic; [`http`] exposes it over axum.

pub mod http;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::error::ValidationError;
use crate::llm::Message;
use crate::metrics::MetricsCollector;
use crate::scheduler::{
    validate_priority, ChatPayload, PayloadLimits, QueueError, QueueStats, RetryPolicy,
    TaskSnapshot, TaskStore, DEFAULT_PRIORITY,
};
use crate::status::{ResultEvent, ResultStream, StatusEvent, StatusHub, StatusStream};

/// Errors returned to API callers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The submitted payload breaks the schema.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The request body could not be decoded.
    #[error("Invalid request body: {0}")]
    BadRequest(String),

    /// No task with this id.
    #[error("Task {0} not found")]
    NotFound(String),

    /// The store cannot be reached.
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    /// Anything else.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::Validation(_) | ApiError::BadRequest(_) => 400,
            ApiError::NotFound(_) => 404,
            ApiError::Unavailable(_) => 503,
            ApiError::Internal(_) => 500,
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        if err.is_unavailable() {
            return ApiError::Unavailable(err.to_string());
        }
        match err {
            QueueError::TaskNotFound(id) => ApiError::NotFound(id.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Body of a submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub conversation_history: Option<Vec<Message>>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl SubmitRequest {
    /// A request with only a prompt.
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Self::default()
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Answer to a successful submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub success: bool,
    pub task_id: Uuid,
    pub message: String,
}

/// Per-state task counts as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsResponse {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    /// `waiting + active`.
    pub total: usize,
}

impl From<QueueStats> for StatsResponse {
    fn from(stats: QueueStats) -> Self {
        Self {
            waiting: stats.waiting,
            active: stats.active,
            completed: stats.completed,
            failed: stats.failed,
            total: stats.total(),
        }
    }
}

/// Parses a task id; anything that is not a UUID names no task.
pub fn parse_task_id(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw.trim()).ok()
}

/// Queue operations offered to clients.
#[derive(Clone)]
pub struct QueueApi {
    store: Arc<dyn TaskStore>,
    hub: StatusHub,
    retry: RetryPolicy,
    limits: PayloadLimits,
    metrics: MetricsCollector,
}

impl QueueApi {
    /// Creates the API over a store and its status hub.
    pub fn new(store: Arc<dyn TaskStore>, hub: StatusHub, retry: RetryPolicy) -> Self {
        Self {
            store,
            hub,
            retry,
            limits: PayloadLimits::default(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets the payload limits checked at submission.
    pub fn with_limits(mut self, limits: PayloadLimits) -> Self {
        self.limits = limits;
        self
    }

    /// The status hub behind [`subscribe`](Self::subscribe).
    pub fn hub(&self) -> &StatusHub {
        &self.hub
    }

    /// Validates and enqueues a chat task.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, ApiError> {
        let prompt = request
            .prompt
            .ok_or(ValidationError::MissingField("prompt"))?;
        let priority = request.priority.unwrap_or(DEFAULT_PRIORITY);
        validate_priority(priority)?;

        let mut payload =
            ChatPayload::new(prompt).with_history(request.conversation_history.unwrap_or_default());
        payload.model = request.model.filter(|m| !m.trim().is_empty());
        payload.user_id = request.user_id;
        payload.validate(&self.limits)?;

        let user_id = payload.user_id.clone();
        let task_id = self
            .store
            .enqueue(payload, priority, self.retry.clone())
            .await?;

        info!(
            task_id = %task_id,
            priority = priority,
            user_id = user_id.as_deref().unwrap_or("-"),
            "Task submitted"
        );

        Ok(SubmitResponse {
            success: true,
            task_id,
            message: "Task queued successfully".to_string(),
        })
    }

    /// Returns the current snapshot of a task.
    pub async fn status(&self, task_id: &str) -> Result<TaskSnapshot, ApiError> {
        let not_found = || ApiError::NotFound(task_id.to_string());
        let id = parse_task_id(task_id).ok_or_else(not_found)?;
        let task = self.store.get(id).await?.ok_or_else(not_found)?;
        Ok(task.snapshot())
    }

    /// Returns per-state counts.
    pub async fn stats(&self) -> Result<StatsResponse, ApiError> {
        let stats = self.store.stats().await?;
        self.metrics.update_queue_depth(&stats);
        Ok(stats.into())
    }

    /// Opens a status stream; an unknown id yields a single not-found event.
    pub fn subscribe(&self, task_id: &str) -> StatusStream {
        match parse_task_id(task_id) {
            Some(id) => self.hub.subscribe(id),
            None => {
                let event = StatusEvent::NotFound {
                    task_id: task_id.to_string(),
                };
                Box::pin(futures::stream::iter([event]))
            }
        }
    }

    /// Opens a result stream; an unknown id yields a single error event.
    pub fn subscribe_result(&self, task_id: &str) -> ResultStream {
        match parse_task_id(task_id) {
            Some(id) => self.hub.subscribe_result(id),
            None => {
                let event = ResultEvent::Error {
                    message: format!("Task {} not found", task_id),
                };
                Box::pin(futures::stream::iter([event]))
            }
        }
    }
}
