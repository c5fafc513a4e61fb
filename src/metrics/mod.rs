//! Metrics module for Prometheus-based monitoring.
//!
//! Records task attempts, generation backend calls, queue depth, limiter
//! denials and open status subscriptions.
//!
//! # Example
//!
//! ```ignore
//! use chat_queue::metrics::{init_metrics, export_metrics, AttemptOutcome, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_attempt(AttemptOutcome::Completed, 1.2);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{AttemptOutcome, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics, metrics_handler};

pub use prometheus::{
    ACTIVE_SUBSCRIPTIONS, LLM_LATENCY, LLM_REQUESTS_TOTAL, QUEUE_DEPTH, RATE_LIMIT_DENIALS,
    REGISTRY, TASKS_IN_PROGRESS, TASKS_TOTAL, TASK_DURATION,
};
