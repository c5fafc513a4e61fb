//! Generation backend integration for chat-queue.
//!
//! Workers talk to a text-completion service through the
//! [`GenerationBackend`] trait. Two HTTP clients are provided:
//!
//! - [`OllamaClient`]: Ollama's `/api/chat` endpoint, streamed as NDJSON
//! - [`OpenAiCompatClient`]: any OpenAI-compatible `/chat/completions`
//!   endpoint (LiteLLM, OpenRouter, vLLM), streamed as SSE
//!
//! ```ignore
//! use chat_queue::llm::{GenerationBackend, GenerationRequest, Message, OllamaClient};
//! use futures::StreamExt;
//!
//! let client = OllamaClient::new("http://localhost:11434")?;
//! let request = GenerationRequest::new("qwen3:latest", vec![Message::user("Hello!")])
//!     .with_system_prompt("You are a helpful assistant.");
//!
//! let mut stream = client.generate_stream(&request).await?;
//! while let Some(chunk) = stream.next().await {
//!     print!("{}", chunk?);
//! }
//! ```

pub mod backend;
mod lines;
pub mod ollama;
pub mod openai;

pub use backend::{
    GenerationBackend, GenerationRequest, GenerationResponse, Message, Role, TextStream,
};
pub use ollama::OllamaClient;
pub use openai::OpenAiCompatClient;
