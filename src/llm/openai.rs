//! OpenAI-compatible client (LiteLLM, OpenRouter, vLLM, ...).
//!
//! Streaming uses `stream: true` on `/chat/completions`, which answers with
//! Server-Sent Events: `data: {json}` lines terminated by `data: [DONE]`.

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

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Client for OpenAI-compatible chat completion APIs.
pub struct OpenAiCompatClient {
    /// Base URL for the API, e.g. `http://localhost:4000/v1`.
    api_base: String,
    /// Optional API key for authentication.
    api_key: Option<String>,
    http_client: Client,
}

impl OpenAiCompatClient {
    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `api_base` - Base URL for the API (e.g., "http://localhost:4000/v1")
    /// * `api_key` - Optional bearer token
    pub fn new(api_base: impl Into<String>, api_key: Option<String>) -> Result<Self, LlmError> {
        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| LlmError::RequestFailed(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            http_client,
        })
    }

    /// Get the API base URL.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Check if an API key is configured.
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    async fn send(
        &self,
        request: &GenerationRequest,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let api_request = ApiRequest {
            model: &request.model,
            messages: request.wire_messages(),
            stream,
        };

        let mut http_request = self
            .http_client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Content-Type", "application/json");

        if let Some(ref api_key) = self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = http_request
            .json(&api_request)
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response)
    }
}

/// Internal request structure for the OpenAI-compatible API.
#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    stream: bool,
}

/// Internal response structure from the OpenAI-compatible API.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
}

/// One streamed completion chunk.
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// What a single SSE line means for the stream.
#[derive(Debug, PartialEq)]
enum SseLine {
    Text(String),
    Finished(String),
    Done,
    Ignored,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Ignored;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            let Some(choice) = chunk.choices.into_iter().next() else {
                return SseLine::Ignored;
            };
            let text = choice.delta.content.unwrap_or_default();
            if choice.finish_reason.is_some() {
                SseLine::Finished(text)
            } else {
                SseLine::Text(text)
            }
        }
        Err(e) => {
            tracing::debug!(error = %e, "Skipping unparsable completion chunk");
            SseLine::Ignored
        }
    }
}

#[async_trait]
impl GenerationBackend for OpenAiCompatClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let response = self.send(request, false).await?;
        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse API response: {}", e)))?;

        let content = api_response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(LlmError::EmptyResponse)?;

        Ok(GenerationResponse {
            model: api_response.model.unwrap_or_else(|| request.model.clone()),
            content,
        })
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream, LlmError> {
        let response = self.send(request, true).await?;
        let mut body = response.bytes_stream();

        let stream = async_stream::try_stream! {
            let mut lines = LineBuffer::default();
            let mut finished = false;

            'read: while let Some(bytes) = body.next().await {
                let bytes = bytes.map_err(LlmError::from_reqwest)?;
                for line in lines.push(&bytes) {
                    match parse_sse_line(&line) {
                        SseLine::Text(text) => {
                            if !text.is_empty() {
                                yield text;
                            }
                        }
                        SseLine::Finished(text) => {
                            finished = true;
                            if !text.is_empty() {
                                yield text;
                            }
                        }
                        SseLine::Done => {
                            finished = true;
                            break 'read;
                        }
                        SseLine::Ignored => {}
                    }
                }
            }

            if !finished {
                Err::<(), LlmError>(LlmError::IncompleteStream)?;
            }
        };

        Ok(Box::pin(stream))
    }
}
