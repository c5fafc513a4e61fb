//! Ollama client.
//!
//! Uses the `/api/chat` endpoint. With `stream: true` Ollama answers with
//! newline-delimited JSON objects, each carrying a piece of the assistant
//! message, the last one flagged `done: true`.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::backend::{
    error_from_response, GenerationBackend, GenerationRequest, GenerationResponse, Message,
    TextStream,
};
use super::lines::LineBuffer;
use crate::error::LlmError;

/// Default Ollama endpoint.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Connection timeout; total request time is bounded by the worker's attempt timeout.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Client for a local or remote Ollama server.
pub struct OllamaClient {
    /// Base URL, e.g. `http://localhost:11434`.
    base_url: String,
    http_client: Client,
}

impl OllamaClient {
    /// Create a client for the given base URL.
    ///
    /// A full `/api/chat` or `/api/generate` URL is accepted too; the path is
    /// stripped so either form of `OLLAMA_URL` works.
    pub fn new(base_url: impl Into<String>) -> Result<Self, LlmError> {
        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| LlmError::RequestFailed(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: normalize_base_url(&base_url.into()),
            http_client,
        })
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(
        &self,
        request: &GenerationRequest,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let body = ChatRequest {
            model: &request.model,
            messages: request.wire_messages(),
            stream,
        };

        let response = self
            .http_client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response)
    }
}

fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    for suffix in ["/api/chat", "/api/generate"] {
        if let Some(base) = trimmed.strip_suffix(suffix) {
            return base.to_string();
        }
    }
    trimmed.to_string()
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    stream: bool,
}

/// One NDJSON object. `/api/generate` puts text in `response`, `/api/chat`
/// in `message.content`; both are accepted.
#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

impl ChatChunk {
    fn into_text(self) -> String {
        self.message
            .map(|m| m.content)
            .or(self.response)
            .unwrap_or_default()
    }
}

/// Parses one NDJSON line. Unparsable lines are skipped.
fn parse_line(line: &str) -> Result<Option<ChatChunk>, LlmError> {
    match serde_json::from_str::<ChatChunk>(line) {
        Ok(chunk) => {
            if let Some(error) = chunk.error {
                return Err(LlmError::RequestFailed(format!("Ollama stream error: {}", error)));
            }
            Ok(Some(chunk))
        }
        Err(e) => {
            tracing::debug!(error = %e, "Skipping unparsable Ollama stream line");
            Ok(None)
        }
    }
}

#[async_trait]
impl GenerationBackend for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let response = self.send(request, false).await?;
        let chunk: ChatChunk = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse Ollama response: {}", e)))?;

        if let Some(error) = chunk.error {
            return Err(LlmError::RequestFailed(error));
        }

        let model = chunk.model.clone().unwrap_or_else(|| request.model.clone());
        Ok(GenerationResponse {
            model,
            content: chunk.into_text(),
        })
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream, LlmError> {
        let response = self.send(request, true).await?;
        let mut body = response.bytes_stream();

        let stream = async_stream::try_stream! {
            let mut lines = LineBuffer::default();
            let mut done = false;

            while let Some(bytes) = body.next().await {
                let bytes = bytes.map_err(LlmError::from_reqwest)?;
                for line in lines.push(&bytes) {
                    if let Some(chunk) = parse_line(&line)? {
                        done = chunk.done;
                        let text = chunk.into_text();
                        if !text.is_empty() {
                            yield text;
                        }
                    }
                    if done {
                        break;
                    }
                }
                if done {
                    break;
                }
            }

            if !done {
                if let Some(line) = lines.finish() {
                    if let Some(chunk) = parse_line(&line)? {
                        done = chunk.done;
                        let text = chunk.into_text();
                        if !text.is_empty() {
                            yield text;
                        }
                    }
                }
            }

            if !done {
                Err::<(), LlmError>(LlmError::IncompleteStream)?;
            }
        };

        Ok(Box::pin(stream))
    }
}
