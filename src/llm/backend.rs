//! Backend trait and the request/response types shared by all clients.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Incremental text chunks produced by a streaming generation.
///
/// The stream ends once the backend signals completion; a transport that
/// closes early yields [`LlmError::IncompleteStream`] instead.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A message in a conversation with an LLM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender.
    pub role: Role,
    /// Content of the message.
    pub content: String,
}

impl Message {
    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Request for text generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Model identifier to use for generation.
    pub model: String,
    /// Optional system prompt, sent ahead of the conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Conversation messages; the last one is the prompt being answered.
    pub messages: Vec<Message>,
}

impl GenerationRequest {
    /// Create a new generation request.
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            messages,
        }
    }

    /// Set the system prompt for this request.
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Messages as they go on the wire: system prompt first, then the conversation.
    pub fn wire_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        if let Some(system) = self.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
            messages.push(Message::system(system));
        }
        messages.extend(self.messages.iter().cloned());
        messages
    }
}

/// Completed (non-streaming) generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    /// Model that produced the output.
    pub model: String,
    /// Generated text.
    pub content: String,
}

/// A text-completion service reachable by the worker pool.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Short backend name used in logs and metric labels.
    fn name(&self) -> &str;

    /// Generate a complete response for the given request.
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, LlmError>;

    /// Generate a response incrementally.
    ///
    /// Backends without streaming support fall back to a single chunk.
    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream, LlmError> {
        let response = self.generate(request).await?;
        Ok(Box::pin(futures::stream::once(async move {
            Ok(response.content)
        })))
    }
}

/// Converts a non-2xx response into an [`LlmError`].
///
/// Understands both `{"error": "..."}` (Ollama) and
/// `{"error": {"message": "..."}}` (OpenAI-compatible) bodies.
pub(crate) async fn error_from_response(response: reqwest::Response) -> LlmError {
    let code = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error response".to_string());

    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|value| {
            let error = value.get("error")?;
            error
                .as_str()
                .map(str::to_string)
                .or_else(|| error.get("message")?.as_str().map(str::to_string))
        })
        .unwrap_or(body);

    if code == 429 {
        LlmError::RateLimited(message)
    } else {
        LlmError::ApiError { code, message }
    }
}
