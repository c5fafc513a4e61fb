//! HTTP surface tests, driven through the router without a socket.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use chat_queue::api::http::{router, AppState};
use chat_queue::api::QueueApi;
use chat_queue::metrics::init_metrics;
use chat_queue::scheduler::{MemoryTaskStore, RetryPolicy, TaskResult, TaskStore};
use chat_queue::status::{StatusHub, StatusHubConfig};

fn app() -> (Router, Arc<dyn TaskStore>) {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
    let hub = StatusHub::new(
        Arc::clone(&store),
        StatusHubConfig {
            poll_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_secs(5),
        },
    );
    let api = QueueApi::new(Arc::clone(&store), hub, RetryPolicy::default());
    (router(AppState::new(api)), store)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body");
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

async fn submit(app: &Router, body: Value) -> String {
    let (status, text) = send(app, post_json("/api/tasks", body)).await;
    assert_eq!(status, StatusCode::OK, "body: {}", text);
    let json: Value = serde_json::from_str(&text).expect("json");
    assert_eq!(json["success"], true);
    json["taskId"].as_str().expect("taskId").to_string()
}

#[tokio::test]
async fn test_submit_and_read_status() {
    let (app, _) = app();
    let task_id = submit(
        &app,
        json!({
            "prompt": "What is a queue?",
            "conversationHistory": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"}
            ],
            "priority": 3,
            "userId": "user-7"
        }),
    )
    .await;

    let (status, text) = send(&app, get(&format!("/api/tasks/{}", task_id))).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_str(&text).expect("json");
    assert_eq!(json["taskId"], task_id.as_str());
    assert_eq!(json["state"], "waiting");
    assert_eq!(json["progress"], 0);
    assert_eq!(json["priority"], 3);
    assert_eq!(json["userId"], "user-7");
    assert!(json.get("result").is_none());
}

#[tokio::test]
async fn test_submit_rejects_bad_payloads() {
    let (app, _) = app();

    let (status, text) = send(&app, post_json("/api/tasks", json!({"priority": 1}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(text.contains("prompt"));

    let (status, _) = send(&app, post_json("/api/tasks", json!({"prompt": ""}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        post_json(
            "/api/tasks",
            json!({"prompt": "hi", "conversationHistory": [{"role": "robot", "content": "x"}]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let malformed = Request::builder()
        .method(Method::POST)
        .uri("/api/tasks")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .expect("request");
    let (status, text) = send(&app, malformed).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let json: Value = serde_json::from_str(&text).expect("error body is json");
    assert!(json["error"].is_string());

    let (status, text) = send(&app, get("/api/queue/stats")).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_str(&text).expect("json");
    assert_eq!(json["waiting"], 0);
}

#[tokio::test]
async fn test_stats_counts_waiting_and_active() {
    let (app, store) = app();
    submit(&app, json!({"prompt": "one"})).await;
    submit(&app, json!({"prompt": "two", "priority": 9})).await;
    store.claim_next("worker-0").await.expect("claim").expect("task");

    let (status, text) = send(&app, get("/api/queue/stats")).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_str(&text).expect("json");
    assert_eq!(json["waiting"], 1);
    assert_eq!(json["active"], 1);
    assert_eq!(json["completed"], 0);
    assert_eq!(json["failed"], 0);
    assert_eq!(json["total"], 2);
}

#[tokio::test]
async fn test_unknown_task_is_404() {
    let (app, _) = app();
    let (status, _) = send(
        &app,
        get("/api/tasks/00000000-0000-4000-8000-000000000000"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, text) = send(&app, get("/api/tasks/not-a-task")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(text.contains("not-a-task"));
}

#[tokio::test]
async fn test_stream_of_unknown_task_sends_not_found_and_ends() {
    let (app, _) = app();
    let (status, text) = send(&app, get("/api/tasks/bogus/stream")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("event: not_found"));
    assert!(text.contains(r#""type":"not_found""#));
    assert!(text.contains(r#""taskId":"bogus""#));
}

#[tokio::test]
async fn test_stream_ends_after_completion() {
    let (app, store) = app();
    let task_id = submit(&app, json!({"prompt": "finish me"})).await;
    let id = uuid::Uuid::parse_str(&task_id).expect("uuid");

    let task = store.claim_next("worker-0").await.expect("claim").expect("task");
    assert_eq!(task.id, id);
    store
        .complete(
            id,
            TaskResult {
                response: "done".to_string(),
                model: "qwen3:latest".to_string(),
                completed_at: chrono::Utc::now(),
                worker_id: "worker-0".to_string(),
                duration_ms: 5,
            },
        )
        .await
        .expect("complete");

    let (status, text) = send(&app, get(&format!("/api/tasks/{}/stream", task_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("event: status"));
    assert!(text.contains(r#""state":"completed""#));
    assert!(text.contains(r#""progress":100"#));

    let (status, text) = send(&app, get(&format!("/api/tasks/{}/result", task_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("event: chunk"));
    assert!(text.contains(r#""content":"done""#));
    assert!(text.contains(r#""done":true"#));
}

#[tokio::test]
async fn test_health_and_metrics() {
    init_metrics().expect("metrics");
    let (app, _) = app();

    let (status, text) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_str(&text).expect("json");
    assert_eq!(json["status"], "ok");
    assert!(json["timestamp"].is_string());

    // Stats refresh the depth gauge.
    send(&app, get("/api/queue/stats")).await;
    let (status, text) = send(&app, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(text.contains("chat_queue_depth"));
}

#[tokio::test]
async fn test_cors_preflight() {
    let (app, _) = app();
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/api/tasks")
        .header(header::ORIGIN, "http://localhost:5173")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert!(response.status().is_success());
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
}
