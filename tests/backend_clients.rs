//! Backend clients against an in-process HTTP stub.

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{json, Value};

use chat_queue::error::LlmError;
use chat_queue::llm::{
    GenerationBackend, GenerationRequest, Message, OllamaClient, OpenAiCompatClient,
};

async fn spawn_stub(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

fn request() -> GenerationRequest {
    GenerationRequest::new("stub-model", vec![Message::user("hello")])
        .with_system_prompt("be brief")
}

async fn collect(stream: chat_queue::llm::TextStream) -> Result<String, LlmError> {
    let chunks: Vec<Result<String, LlmError>> = stream.collect().await;
    let mut text = String::new();
    for chunk in chunks {
        text.push_str(&chunk?);
    }
    Ok(text)
}

async fn ollama_chat(Json(body): Json<Value>) -> impl IntoResponse {
    // The system prompt travels as the first message.
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["content"], "hello");

    if body["stream"] == true {
        let lines = [
            json!({"model": "stub-model", "message": {"role": "assistant", "content": "Hel"}, "done": false}),
            json!({"model": "stub-model", "message": {"role": "assistant", "content": "lo"}, "done": false}),
            json!({"model": "stub-model", "message": {"role": "assistant", "content": ""}, "done": true}),
        ];
        let body: String = lines.iter().map(|l| format!("{}\n", l)).collect();
        ([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response()
    } else {
        Json(json!({
            "model": "stub-model",
            "message": {"role": "assistant", "content": "Hello"},
            "done": true
        }))
        .into_response()
    }
}

async fn ollama_truncated() -> impl IntoResponse {
    let line = json!({"message": {"role": "assistant", "content": "Hel"}, "done": false});
    format!("{}\n", line)
}

async fn openai_completions(headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some("Bearer test-key");
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": {"message": "bad key"}})),
        )
            .into_response();
    }

    if body["stream"] == true {
        let events = [
            ": keep-alive".to_string(),
            format!("data: {}", json!({"choices": [{"delta": {"content": "Hi "}}]})),
            format!("data: {}", json!({"choices": [{"delta": {"content": "there"}, "finish_reason": "stop"}]})),
            "data: [DONE]".to_string(),
        ];
        let body: String = events.iter().map(|e| format!("{}\n\n", e)).collect();
        ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
    } else {
        Json(json!({
            "model": "stub-model",
            "choices": [{"message": {"role": "assistant", "content": "Hi there"}}]
        }))
        .into_response()
    }
}

async fn rate_limited() -> impl IntoResponse {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({"error": "slow down"})),
    )
}

#[tokio::test]
async fn test_ollama_streams_ndjson() {
    let base = spawn_stub(Router::new().route("/api/chat", post(ollama_chat))).await;
    let client = OllamaClient::new(base).expect("client");

    let stream = client.generate_stream(&request()).await.expect("stream");
    assert_eq!(collect(stream).await.expect("text"), "Hello");

    let response = client.generate(&request()).await.expect("generate");
    assert_eq!(response.content, "Hello");
    assert_eq!(response.model, "stub-model");
}

#[tokio::test]
async fn test_ollama_stream_without_done_is_incomplete() {
    let base = spawn_stub(Router::new().route("/api/chat", post(ollama_truncated))).await;
    let client = OllamaClient::new(format!("{}/api/chat", base)).expect("client");

    let stream = client.generate_stream(&request()).await.expect("stream");
    let result = collect(stream).await;
    assert!(matches!(result, Err(LlmError::IncompleteStream)));
}

#[tokio::test]
async fn test_openai_streams_sse() {
    let base = spawn_stub(Router::new().route("/chat/completions", post(openai_completions))).await;
    let client = OpenAiCompatClient::new(base, Some("test-key".to_string())).expect("client");

    let stream = client.generate_stream(&request()).await.expect("stream");
    assert_eq!(collect(stream).await.expect("text"), "Hi there");

    let response = client.generate(&request()).await.expect("generate");
    assert_eq!(response.content, "Hi there");
}

#[tokio::test]
async fn test_openai_error_body_is_surfaced() {
    let base = spawn_stub(Router::new().route("/chat/completions", post(openai_completions))).await;
    let client = OpenAiCompatClient::new(base, None).expect("client");

    let err = client
        .generate_stream(&request())
        .await
        .err()
        .expect("unauthorized");
    match err {
        LlmError::ApiError { code, message } => {
            assert_eq!(code, 401);
            assert_eq!(message, "bad key");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_http_429_maps_to_rate_limited() {
    let base = spawn_stub(Router::new().route("/api/chat", post(rate_limited))).await;
    let client = OllamaClient::new(base).expect("client");

    let err = client.generate(&request()).await.err().expect("rate limited");
    assert!(matches!(err, LlmError::RateLimited(ref m) if m == "slow down"));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_unreachable_backend_fails_request() {
    let client = OllamaClient::new("http://127.0.0.1:1").expect("client");
    let err = client.generate(&request()).await.err().expect("unreachable");
    assert!(matches!(err, LlmError::RequestFailed(_)));
}
