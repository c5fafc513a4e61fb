//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by chat-queue and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all chat-queue metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of finished task attempts, labeled by outcome
/// (`completed`, `retried`, `failed`).
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Attempt duration in seconds, labeled by outcome.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of tasks per state, refreshed on every stats query.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of tasks currently being generated in this process.
pub static TASKS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Total generation backend requests, labeled by backend and status.
pub static LLM_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Generation latency in seconds, labeled by backend.
pub static LLM_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Admissions refused by the start-rate limiter.
pub static RATE_LIMIT_DENIALS: OnceLock<Counter> = OnceLock::new();

/// Open status subscriptions.
pub static ACTIVE_SUBSCRIPTIONS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup; later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Task metrics
    let tasks_total = CounterVec::new(
        Opts::new("chat_queue_tasks_total", "Total number of finished task attempts"),
        &["outcome"],
    )?;

    let task_duration = HistogramVec::new(
        HistogramOpts::new(
            "chat_queue_task_duration_seconds",
            "Task attempt duration in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        &["outcome"],
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("chat_queue_depth", "Number of tasks per state"),
        &["state"],
    )?;

    let tasks_in_progress = Gauge::new(
        "chat_queue_tasks_in_progress",
        "Number of tasks currently being generated",
    )?;

    // Backend metrics
    let llm_requests_total = CounterVec::new(
        Opts::new("chat_queue_llm_requests_total", "Total generation backend requests"),
        &["backend", "status"],
    )?;

    let llm_latency = HistogramVec::new(
        HistogramOpts::new(
            "chat_queue_llm_latency_seconds",
            "Generation latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["backend"],
    )?;

    // Admission and distribution metrics
    let rate_limit_denials = Counter::new(
        "chat_queue_rate_limit_denials_total",
        "Task starts refused by the rate limiter",
    )?;

    let active_subscriptions = Gauge::new(
        "chat_queue_active_subscriptions",
        "Open status subscriptions",
    )?;

    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(tasks_in_progress.clone()))?;
    registry.register(Box::new(llm_requests_total.clone()))?;
    registry.register(Box::new(llm_latency.clone()))?;
    registry.register(Box::new(rate_limit_denials.clone()))?;
    registry.register(Box::new(active_subscriptions.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = TASKS_IN_PROGRESS.set(tasks_in_progress);
    let _ = LLM_REQUESTS_TOTAL.set(llm_requests_total);
    let _ = LLM_LATENCY.set(llm_latency);
    let _ = RATE_LIMIT_DENIALS.set(rate_limit_denials);
    let _ = ACTIVE_SUBSCRIPTIONS.set(active_subscriptions);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// HTTP handler for the /metrics endpoint.
pub async fn metrics_handler() -> String {
    export_metrics()
}
