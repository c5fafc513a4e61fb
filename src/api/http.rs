//! HTTP routes over [`QueueApi`].
//!
//! JSON for request/response endpoints, server-sent events for the status
//! and result streams.

use std::convert::Infallible;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use super::{ApiError, QueueApi, StatsResponse, SubmitRequest, SubmitResponse};
use crate::metrics::metrics_handler;
use crate::scheduler::{PoolStats, PoolStatsHandle, TaskSnapshot};

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub api: QueueApi,
    /// Present when this process runs workers.
    pub workers: Option<PoolStatsHandle>,
}

impl AppState {
    pub fn new(api: QueueApi) -> Self {
        Self { api, workers: None }
    }

    pub fn with_workers(mut self, workers: PoolStatsHandle) -> Self {
        self.workers = Some(workers);
        self
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<PoolStats>,
}

/// Builds the router with CORS and request tracing.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/tasks", post(submit_task))
        .route("/api/queue/stats", get(queue_stats))
        .route("/api/tasks/{id}", get(task_status))
        .route("/api/tasks/{id}/stream", get(task_stream))
        .route("/api/tasks/{id}/result", get(task_result))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn submit_task(
    State(state): State<AppState>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let Json(request) = body.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    Ok(Json(state.api.submit(request).await?))
}

async fn queue_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    Ok(Json(state.api.stats().await?))
}

async fn task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskSnapshot>, ApiError> {
    Ok(Json(state.api.status(&id).await?))
}

async fn task_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let keep_alive = keep_alive(&state);
    let stream = state
        .api
        .subscribe(&id)
        .map(|event| Ok(sse_event(event.event_name(), &event)));
    Sse::new(stream).keep_alive(keep_alive)
}

async fn task_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let keep_alive = keep_alive(&state);
    let stream = state
        .api
        .subscribe_result(&id)
        .map(|event| Ok(sse_event(event.event_name(), &event)));
    Sse::new(stream).keep_alive(keep_alive)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now(),
        workers: state.workers.as_ref().map(PoolStatsHandle::snapshot),
    })
}

fn keep_alive(state: &AppState) -> KeepAlive {
    KeepAlive::new()
        .interval(state.api.hub().config().heartbeat_interval)
        .text("keep-alive")
}

fn sse_event<T: Serialize>(name: &'static str, payload: &T) -> SseEvent {
    let data = serde_json::to_string(payload).unwrap_or_else(|e| {
        serde_json::json!({ "type": "error", "message": e.to_string() }).to_string()
    });
    SseEvent::default().event(name).data(data)
}
