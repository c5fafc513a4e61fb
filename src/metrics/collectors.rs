//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code
//! can record unconditionally.

use super::prometheus::{
    ACTIVE_SUBSCRIPTIONS, LLM_LATENCY, LLM_REQUESTS_TOTAL, QUEUE_DEPTH, RATE_LIMIT_DENIALS,
    TASKS_IN_PROGRESS, TASKS_TOTAL, TASK_DURATION,
};
use crate::scheduler::QueueStats;

/// How a task attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The task completed with a result.
    Completed,
    /// The attempt failed and the task went back to waiting.
    Retried,
    /// The task failed for good.
    Failed,
}

impl AttemptOutcome {
    /// Metric label for this outcome.
    pub fn as_label(self) -> &'static str {
        match self {
            AttemptOutcome::Completed => "completed",
            AttemptOutcome::Retried => "retried",
            AttemptOutcome::Failed => "failed",
        }
    }
}

/// Metrics collector for recording chat-queue operational metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record the end of a task attempt.
    pub fn record_attempt(&self, outcome: AttemptOutcome, duration_secs: f64) {
        let label = outcome.as_label();

        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&[label]).inc();
        }

        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[label])
                .observe(duration_secs);
        }

        tracing::trace!(
            outcome = label,
            duration_secs = duration_secs,
            "Recorded task attempt metric"
        );
    }

    /// Record a generation backend request.
    pub fn record_llm_request(&self, backend: &str, success: bool, latency_secs: f64) {
        let status = if success { "success" } else { "failure" };

        if let Some(llm_requests) = LLM_REQUESTS_TOTAL.get() {
            llm_requests.with_label_values(&[backend, status]).inc();
        }

        if let Some(llm_latency) = LLM_LATENCY.get() {
            llm_latency
                .with_label_values(&[backend])
                .observe(latency_secs);
        }

        tracing::trace!(
            backend = backend,
            status = status,
            latency_secs = latency_secs,
            "Recorded LLM request metric"
        );
    }

    /// Publish per-state task counts.
    pub fn update_queue_depth(&self, stats: &QueueStats) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&["waiting"])
                .set(stats.waiting as f64);
            queue_depth
                .with_label_values(&["active"])
                .set(stats.active as f64);
            queue_depth
                .with_label_values(&["completed"])
                .set(stats.completed as f64);
            queue_depth
                .with_label_values(&["failed"])
                .set(stats.failed as f64);
        }
    }

    /// Count a start refused by the rate limiter.
    pub fn record_rate_limited(&self) {
        if let Some(denials) = RATE_LIMIT_DENIALS.get() {
            denials.inc();
        }
    }

    /// Increment the count of tasks in progress by 1.
    pub fn inc_tasks_in_progress(&self) {
        if let Some(in_progress) = TASKS_IN_PROGRESS.get() {
            in_progress.inc();
        }
    }

    /// Decrement the count of tasks in progress by 1.
    pub fn dec_tasks_in_progress(&self) {
        if let Some(in_progress) = TASKS_IN_PROGRESS.get() {
            in_progress.dec();
        }
    }

    /// Set the number of open status subscriptions.
    pub fn update_subscriptions(&self, count: usize) {
        if let Some(subscriptions) = ACTIVE_SUBSCRIPTIONS.get() {
            subscriptions.set(count as f64);
        }
    }
}
