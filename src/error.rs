//! Error types for chat-queue operations.
//!
//! Defines the error types shared across subsystems:
//! - Generation backend (LLM) interactions
//! - Task payload validation
//!
//! Queue, worker pool and API errors live next to the code that raises them.

use thiserror::Error;

/// Errors that can occur while talking to a generation backend.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse backend response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Backend error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Stream ended before the backend signalled completion")]
    IncompleteStream,

    #[error("Backend returned an empty response")]
    EmptyResponse,
}

impl LlmError {
    /// Returns whether the error is transient (network, 5xx, 429).
    ///
    /// Used for logging and metrics; the worker pool retries every backend
    /// error regardless.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RequestFailed(_) | LlmError::IncompleteStream => true,
            LlmError::RateLimited(_) => true,
            LlmError::ApiError { code, .. } => *code >= 500 || *code == 429,
            LlmError::ParseError(_) | LlmError::EmptyResponse => false,
        }
    }

    /// Builds an error from a failed reqwest call.
    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_decode() {
            LlmError::ParseError(err.to_string())
        } else {
            LlmError::RequestFailed(err.to_string())
        }
    }
}

/// Errors raised when a chat payload or submission is malformed.
///
/// These are caller errors: they are rejected at submission time and, if a
/// malformed record ever reaches a worker, fail the task without retry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Prompt is empty")]
    EmptyPrompt,

    #[error("Prompt exceeds {limit} characters")]
    PromptTooLong { limit: usize },

    #[error("Conversation history exceeds {limit} messages")]
    HistoryTooLong { limit: usize },

    #[error("Conversation history entry {index} has role '{role}'; only user and assistant are allowed")]
    InvalidRole { index: usize, role: String },

    #[error("Priority {priority} is outside [{min}, {max}]")]
    PriorityOutOfRange { priority: i32, min: i32, max: i32 },

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}
