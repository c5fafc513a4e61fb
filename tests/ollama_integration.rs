//! Integration tests against a live Ollama server.
//!
//! Run with: OLLAMA_URL=http://localhost:11434 OLLAMA_TEST_MODEL=qwen3:latest \
//!   cargo test --test ollama_integration -- --ignored

use futures::StreamExt;

use chat_queue::llm::{GenerationBackend, GenerationRequest, Message, OllamaClient};

fn create_test_client() -> OllamaClient {
    let url = std::env::var("OLLAMA_URL").unwrap_or_else(|_| "http://localhost:11434".to_string());
    OllamaClient::new(url).expect("client")
}

fn test_model() -> String {
    std::env::var("OLLAMA_TEST_MODEL").unwrap_or_else(|_| "qwen3:latest".to_string())
}

#[tokio::test]
#[ignore] // Run with: cargo test --test ollama_integration -- --ignored
async fn test_simple_generation() {
    let client = create_test_client();
    let request = GenerationRequest::new(
        test_model(),
        vec![Message::user("What is 2 + 2? Reply with just the number.")],
    )
    .with_system_prompt("You are a helpful assistant. Reply concisely.");

    let response = client.generate(&request).await;
    assert!(response.is_ok(), "Generation failed: {:?}", response.err());
    let response = response.expect("Should have response");
    assert!(
        response.content.contains('4'),
        "Response should contain '4', got: {}",
        response.content
    );
}

#[tokio::test]
#[ignore]
async fn test_streaming_generation() {
    let client = create_test_client();
    let request = GenerationRequest::new(
        test_model(),
        vec![
            Message::user("My name is Ada."),
            Message::assistant("Nice to meet you, Ada."),
            Message::user("What is my name? Reply with one word."),
        ],
    );

    let mut stream = client.generate_stream(&request).await.expect("stream");
    let mut text = String::new();
    let mut chunks = 0;
    while let Some(chunk) = stream.next().await {
        text.push_str(&chunk.expect("chunk"));
        chunks += 1;
    }

    assert!(chunks > 0, "Should receive at least one chunk");
    assert!(text.contains("Ada"), "Response should mention Ada, got: {}", text);
}
