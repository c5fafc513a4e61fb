//! Worker pool for processing chat tasks from the store.
//!
//! Each worker runs as an independent async task: it waits for a start
//! admission from the shared rate limiter, claims the best eligible task,
//! streams the answer from the generation backend while reporting progress,
//! and records the outcome.
//!
//! # Features
//!
//! - Fixed concurrency (one task per worker)
//! - Sliding-window start limit shared by all workers
//! - Retry with exponential backoff, decided by the store
//! - Graceful shutdown with broadcast channel
//! - Pool statistics tracking

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::LlmError;
use crate::llm::{GenerationBackend, GenerationRequest, Message};
use crate::metrics::{AttemptOutcome, MetricsCollector};

use super::job::{ChatPayload, FailureOutcome, PayloadLimits, Task, TaskResult};
use super::rate_limit::RateLimiter;
use super::store::{QueueError, TaskStore};


/// Upper bound for the claim backoff while the store is unreachable.
const MAX_CLAIM_BACKOFF: Duration = Duration::from_secs(10);

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The store failed during startup.
    #[error("Queue store error: {0}")]
    Store(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn (maximum concurrent generations).
    pub num_workers: usize,
    /// How often to poll for new tasks when the queue is empty.
    pub poll_interval: Duration,
    /// Maximum time allowed for a single attempt.
    pub job_timeout: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Task starts admitted per rate-limit window.
    pub rate_limit_max: usize,
    /// Length of the rate-limit window.
    pub rate_limit_window: Duration,
    /// Model used when a payload does not name one.
    pub default_model: String,
    /// System prompt sent ahead of every conversation.
    pub system_prompt: Option<String>,
    /// Payload checks applied before generation.
    pub payload_limits: PayloadLimits,
    /// First delay before retrying an outcome write the store refused.
    pub store_retry_base: Duration,
    /// Upper bound for the outcome write retry delay.
    pub store_retry_max: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 3,
            poll_interval: Duration::from_millis(500),
            job_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
            rate_limit_max: 10,
            rate_limit_window: Duration::from_secs(60),
            default_model: "qwen3:latest".to_string(),
            system_prompt: None,
            payload_limits: PayloadLimits::default(),
            store_retry_base: Duration::from_millis(200),
            store_retry_max: Duration::from_secs(5),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the per-attempt timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the start-rate limit.
    pub fn with_rate_limit(mut self, max_starts: usize, window: Duration) -> Self {
        self.rate_limit_max = max_starts;
        self.rate_limit_window = window;
        self
    }

    /// Sets the default model.
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Sets the system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Sets the payload limits.
    pub fn with_payload_limits(mut self, limits: PayloadLimits) -> Self {
        self.payload_limits = limits;
        self
    }

    /// Sets the backoff used while the store refuses outcome writes.
    pub fn with_store_retry(mut self, base: Duration, max: Duration) -> Self {
        self.store_retry_base = base;
        self.store_retry_max = max;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently generating.
    pub active_workers: usize,
    /// Tasks completed by this pool.
    pub tasks_completed: u64,
    /// Failed attempts that were scheduled for retry.
    pub tasks_retried: u64,
    /// Tasks that failed for good.
    pub tasks_failed: u64,
    /// Average attempt duration in milliseconds.
    pub average_attempt_ms: u64,
}

impl PoolStats {
    /// Returns the total number of attempts finished.
    pub fn total_attempts(&self) -> u64 {
        self.tasks_completed + self.tasks_retried + self.tasks_failed
    }

    /// Returns the share of finished tasks that completed, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let finished = self.tasks_completed + self.tasks_failed;
        if finished == 0 {
            return 0.0;
        }
        (self.tasks_completed as f64 / finished as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    tasks_completed: AtomicU64,
    tasks_retried: AtomicU64,
    tasks_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            tasks_completed: AtomicU64::new(0),
            tasks_retried: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, outcome: AttemptOutcome, duration: Duration) {
        let counter = match outcome {
            AttemptOutcome::Completed => &self.tasks_completed,
            AttemptOutcome::Retried => &self.tasks_retried,
            AttemptOutcome::Failed => &self.tasks_failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.tasks_completed.load(Ordering::SeqCst);
        let retried = self.tasks_retried.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let attempts = completed + retried + failed;
        let average_attempt_ms = if attempts > 0 {
            total_duration_ms / attempts
        } else {
            0
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            tasks_completed: completed,
            tasks_retried: retried,
            tasks_failed: failed,
            average_attempt_ms,
        }
    }
}

/// Cheap, cloneable read access to a pool's statistics.
#[derive(Clone)]
pub struct PoolStatsHandle {
    stats: Arc<SharedPoolStats>,
    num_workers: usize,
}

impl PoolStatsHandle {
    /// Returns current pool statistics.
    pub fn snapshot(&self) -> PoolStats {
        self.stats.to_pool_stats(self.num_workers)
    }
}

/// Advisory progress derived from the amount of streamed text.
///
/// 10% once generation starts, 30% once the backend answers, then one point
/// per ~17 characters up to 90%. Completion sets 100%.
#[derive(Debug, Default)]
pub(crate) struct ProgressEstimator {
    reported: u8,
}

impl ProgressEstimator {
    pub(crate) const STARTED: u8 = 10;
    pub(crate) const STREAMING: u8 = 30;
    pub(crate) const CEILING: u8 = 90;
    const CHARS_FOR_FULL_SPAN: usize = 1000;

    /// Progress for the given amount of streamed text.
    pub(crate) fn estimate(chars: usize) -> u8 {
        let span = (Self::CEILING - Self::STREAMING) as usize;
        let gained = chars.saturating_mul(span) / Self::CHARS_FOR_FULL_SPAN;
        (Self::STREAMING as usize + gained).min(Self::CEILING as usize) as u8
    }

    /// Returns the value to report, if it moved forward.
    pub(crate) fn advance_to(&mut self, percent: u8) -> Option<u8> {
        if percent > self.reported {
            self.reported = percent;
            Some(percent)
        } else {
            None
        }
    }

    /// Returns the value to report after `chars` streamed, if it moved forward.
    pub(crate) fn observe(&mut self, chars: usize) -> Option<u8> {
        self.advance_to(Self::estimate(chars))
    }
}

/// Everything a worker shares with its siblings.
struct WorkerContext {
    store: Arc<dyn TaskStore>,
    backend: Arc<dyn GenerationBackend>,
    limiter: Arc<RateLimiter>,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
    config: WorkerPoolConfig,
}

/// Worker pool that manages multiple workers processing tasks from a store.
pub struct WorkerPool {
    context: Arc<WorkerContext>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    /// Renews the store lease and sweeps orphans, for stores with leases.
    lease_keeper: Option<JoinHandle<()>>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a new worker pool over a store and a generation backend.
    pub fn new(
        config: WorkerPoolConfig,
        store: Arc<dyn TaskStore>,
        backend: Arc<dyn GenerationBackend>,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_max,
            config.rate_limit_window,
        ));

        Self {
            context: Arc::new(WorkerContext {
                store,
                backend,
                limiter,
                stats: Arc::new(SharedPoolStats::new()),
                metrics: MetricsCollector::new(),
                config,
            }),
            shutdown_tx,
            worker_handles: Vec::new(),
            lease_keeper: None,
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers in the pool.
    ///
    /// Tasks left active by a previous process are recovered first. When the
    /// store leases its claims, a keeper task renews the lease and keeps
    /// sweeping for orphans until the pool shuts down.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        let lease_ttl = self.context.store.lease_ttl();
        if lease_ttl.is_some() {
            if let Err(e) = self.context.store.renew_lease().await {
                warn!(error = %e, "Failed to take the store lease");
            }
        }

        match self.context.store.recover_orphans().await {
            Ok(recovered) => {
                if recovered > 0 {
                    info!(recovered = recovered, "Recovered tasks left active by a previous run");
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to recover orphaned tasks");
            }
        }

        for i in 0..self.context.config.num_workers {
            let worker = Worker::new(
                format!("worker-{}", i),
                Arc::clone(&self.context),
                self.shutdown_tx.subscribe(),
            );

            let handle = tokio::spawn(async move {
                worker.run().await;
            });

            self.worker_handles.push(handle);
        }

        if let Some(ttl) = lease_ttl {
            let store = Arc::clone(&self.context.store);
            self.lease_keeper = Some(tokio::spawn(keep_lease(store, ttl)));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            num_workers = self.context.config.num_workers,
            backend = self.context.backend.name(),
            store = self.context.store.name(),
            rate_limit_max = self.context.config.rate_limit_max,
            rate_limit_window_ms = self.context.config.rate_limit_window.as_millis() as u64,
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers stop claiming immediately and finish their current task. Any
    /// still running after the shutdown timeout are aborted; their tasks stay
    /// active and are recovered on the next start.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let timeout = self.context.config.shutdown_timeout;
        let handles = &mut self.worker_handles;
        let shutdown_future = async {
            for handle in handles.iter_mut() {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(timeout, shutdown_future).await;
        for handle in self.worker_handles.drain(..) {
            handle.abort();
        }
        // The lease outlives the workers so their last writes are accepted.
        if let Some(keeper) = self.lease_keeper.take() {
            keeper.abort();
        }
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.context
            .stats
            .to_pool_stats(self.context.config.num_workers)
    }

    /// Returns a handle for reading statistics without holding the pool.
    pub fn stats_handle(&self) -> PoolStatsHandle {
        PoolStatsHandle {
            stats: Arc::clone(&self.context.stats),
            num_workers: self.context.config.num_workers,
        }
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.context.config.num_workers
    }

    /// Returns the shared start limiter.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.context.limiter
    }
}

/// A single worker that processes tasks from the store.
pub struct Worker {
    /// Unique identifier for this worker.
    id: String,
    context: Arc<WorkerContext>,
    /// Receiver for shutdown signal.
    shutdown_rx: broadcast::Receiver<()>,
}

impl Worker {
    fn new(id: String, context: Arc<WorkerContext>, shutdown_rx: broadcast::Receiver<()>) -> Self {
        Self {
            id,
            context,
            shutdown_rx,
        }
    }

    /// Main worker loop.
    ///
    /// Continuously claims and processes tasks until a shutdown signal is
    /// received.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");
        let mut claim_failures: u32 = 0;

        loop {
            // Check for shutdown signal (non-blocking)
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    continue;
                }
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let Some(admitted_at) = self.context.limiter.try_acquire() else {
                self.context.metrics.record_rate_limited();
                let wait = self
                    .context
                    .limiter
                    .retry_after()
                    .min(self.context.config.poll_interval)
                    .max(Duration::from_millis(1));
                debug!(worker_id = %self.id, wait_ms = wait.as_millis() as u64, "Start rate limit reached");
                if self.sleep_or_shutdown(wait).await {
                    break;
                }
                continue;
            };

            match self.context.store.claim_next(&self.id).await {
                Ok(Some(task)) => {
                    claim_failures = 0;
                    self.process_task(task).await;
                }
                Ok(None) => {
                    claim_failures = 0;
                    self.context.limiter.refund(admitted_at);
                    if self.sleep_or_shutdown(self.context.config.poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    self.context.limiter.refund(admitted_at);
                    claim_failures = claim_failures.saturating_add(1);
                    let delay = claim_backoff(self.context.config.poll_interval, claim_failures);
                    error!(
                        worker_id = %self.id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Failed to claim task"
                    );
                    if self.sleep_or_shutdown(delay).await {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Sleeps for `duration`; returns `true` if shutdown was signalled meanwhile.
    async fn sleep_or_shutdown(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.shutdown_rx.recv() => true,
        }
    }

    /// Processes a single claimed task.
    async fn process_task(&self, task: Task) {
        let task_id = task.id;
        let start_time = Instant::now();

        info!(
            worker_id = %self.id,
            task_id = %task_id,
            attempt = task.attempts,
            max_attempts = task.retry.max_attempts,
            priority = task.priority,
            user_id = task.payload.user_id.as_deref().unwrap_or("-"),
            "Processing task"
        );

        self.context.stats.increment_active();
        self.context.metrics.inc_tasks_in_progress();

        let outcome = match task.payload.validate(&self.context.config.payload_limits) {
            Err(e) => {
                warn!(worker_id = %self.id, task_id = %task_id, error = %e, "Invalid payload, failing without retry");
                let reason = e.to_string();
                self.write_with_retry(task_id, "fail", || {
                    self.context.store.fail_permanently(task_id, &reason)
                })
                .await
                .map(|()| AttemptOutcome::Failed)
            }
            Ok(()) => self.execute_with_timeout(&task).await,
        };

        let duration = start_time.elapsed();
        self.context.stats.decrement_active();
        self.context.metrics.dec_tasks_in_progress();

        match outcome {
            Ok(outcome) => {
                self.context.stats.record(outcome, duration);
                self.context
                    .metrics
                    .record_attempt(outcome, duration.as_secs_f64());
            }
            Err(e) => {
                error!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    error = %e,
                    "Failed to record task outcome"
                );
            }
        }
    }

    /// Runs one attempt with the configured timeout and records its outcome.
    async fn execute_with_timeout(&self, task: &Task) -> Result<AttemptOutcome, QueueError> {
        let task_id = task.id;
        let started = Instant::now();
        let timeout = self.context.config.job_timeout;
        let request = self.build_request(&task.payload);
        let backend_name = self.context.backend.name().to_string();

        let generated = tokio::time::timeout(timeout, self.generate(task_id, &request)).await;
        let latency = started.elapsed();

        let (error, transient) = match generated {
            Ok(Ok(response)) => {
                self.context
                    .metrics
                    .record_llm_request(&backend_name, true, latency.as_secs_f64());

                let result = TaskResult {
                    response,
                    model: request.model.clone(),
                    completed_at: Utc::now(),
                    worker_id: self.id.clone(),
                    duration_ms: latency.as_millis() as u64,
                };

                self.write_with_retry(task_id, "complete", || {
                    self.context.store.complete(task_id, result.clone())
                })
                .await?;

                info!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    model = %request.model,
                    duration_ms = latency.as_millis() as u64,
                    "Task completed successfully"
                );
                return Ok(AttemptOutcome::Completed);
            }
            Ok(Err(e)) => (e.to_string(), e.is_transient()),
            Err(_) => (
                format!("Generation timed out after {:?}", timeout),
                true,
            ),
        };

        self.context
            .metrics
            .record_llm_request(&backend_name, false, latency.as_secs_f64());

        let outcome = self
            .write_with_retry(task_id, "fail", || self.context.store.fail(task_id, &error))
            .await?;

        match outcome {
            FailureOutcome::Retry { delay, .. } => {
                warn!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    error = %error,
                    transient = transient,
                    attempt = task.attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    "Task attempt failed, scheduled for retry"
                );
                Ok(AttemptOutcome::Retried)
            }
            FailureOutcome::Failed => {
                error!(
                    worker_id = %self.id,
                    task_id = %task_id,
                    error = %error,
                    transient = transient,
                    attempts = task.attempts,
                    "Task failed after exhausting attempts"
                );
                Ok(AttemptOutcome::Failed)
            }
        }
    }

    /// Streams a response from the backend, reporting progress as text arrives.
    async fn generate(&self, task_id: Uuid, request: &GenerationRequest) -> Result<String, LlmError> {
        let mut progress = ProgressEstimator::default();
        if let Some(p) = progress.advance_to(ProgressEstimator::STARTED) {
            self.report_progress(task_id, p).await;
        }

        let mut stream = self.context.backend.generate_stream(request).await?;
        if let Some(p) = progress.advance_to(ProgressEstimator::STREAMING) {
            self.report_progress(task_id, p).await;
        }

        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            output.push_str(&chunk?);
            if let Some(p) = progress.observe(output.chars().count()) {
                self.report_progress(task_id, p).await;
            }
        }

        if output.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(output)
    }

    async fn report_progress(&self, task_id: Uuid, percent: u8) {
        if let Err(e) = self
            .context
            .store
            .report_progress(task_id, i32::from(percent))
            .await
        {
            debug!(worker_id = %self.id, task_id = %task_id, error = %e, "Progress update dropped");
        }
    }

    fn build_request(&self, payload: &ChatPayload) -> GenerationRequest {
        let model = payload
            .model
            .clone()
            .unwrap_or_else(|| self.context.config.default_model.clone());

        let mut messages = payload.conversation_history.clone();
        messages.push(Message::user(payload.prompt.clone()));

        let request = GenerationRequest::new(model, messages);
        match &self.context.config.system_prompt {
            Some(system) => request.with_system_prompt(system.clone()),
            None => request,
        }
    }

    /// Retries a store write for as long as the store is unreachable.
    ///
    /// An outcome that never reaches the store leaves its task active, so
    /// there is no attempt cap: the delay doubles up to `store_retry_max`
    /// until the write lands or fails for another reason. A shutdown that
    /// outlasts the pool timeout aborts the worker and the next start
    /// recovers the task.
    async fn write_with_retry<T, F, Fut>(
        &self,
        task_id: Uuid,
        operation: &str,
        mut write: F,
    ) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let max_delay = self.context.config.store_retry_max;
        let mut delay = self.context.config.store_retry_base.min(max_delay);
        let mut attempt: u32 = 1;
        loop {
            match write().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            worker_id = %self.id,
                            task_id = %task_id,
                            operation = operation,
                            attempts = attempt,
                            "Store write succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if e.is_unavailable() => {
                    warn!(
                        worker_id = %self.id,
                        task_id = %task_id,
                        operation = operation,
                        attempt = attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Store write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2).min(max_delay);
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Renews the store lease and recovers expired claims at a third of the TTL.
async fn keep_lease(store: Arc<dyn TaskStore>, ttl: Duration) {
    let every = (ttl / 3).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(e) = store.renew_lease().await {
            warn!(error = %e, "Failed to renew the store lease");
            continue;
        }
        match store.recover_orphans().await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered = recovered, "Recovered tasks of a stopped process"),
            Err(e) => warn!(error = %e, "Orphan sweep failed"),
        }
    }
}

/// Claim backoff while the store keeps failing: doubles per failure.
fn claim_backoff(poll_interval: Duration, failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(16));
    poll_interval.saturating_mul(factor).min(MAX_CLAIM_BACKOFF)
}
