//! Task definitions for the scheduler.
//!
//! This module defines the core types of the queue:
//!
//! - `ChatPayload`: the validated request a task answers
//! - `Task`: the unit of work stored in the queue, with its lifecycle
//! - `TaskState`: tagged state machine (`Waiting | Active | Completed | Failed`)
//! - `RetryPolicy`: attempt budget and exponential backoff
//! - `TaskSnapshot`: point-in-time view handed to observers

use std::cmp::Reverse;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::ValidationError;
use crate::llm::{Message, Role};

/// Default maximum number of execution attempts for a task.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default priority for tasks (higher values are serviced first).
pub const DEFAULT_PRIORITY: i32 = 0;

/// Priorities must lie within `[-PRIORITY_LIMIT, PRIORITY_LIMIT]`.
pub const PRIORITY_LIMIT: i32 = 1_000_000;

/// Sequence numbers are folded into the low 32 bits of the rank score.
const SEQUENCE_SPAN: f64 = 4_294_967_296.0;

/// Limits applied when validating a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadLimits {
    /// Maximum prompt length in characters.
    pub max_prompt_chars: usize,
    /// Maximum number of prior conversation turns.
    pub max_history: usize,
}

impl Default for PayloadLimits {
    fn default() -> Self {
        Self {
            max_prompt_chars: 32_000,
            max_history: 100,
        }
    }
}

/// The request a chat task answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    /// The user prompt.
    pub prompt: String,
    /// Prior conversation turns, oldest first.
    #[serde(default)]
    pub conversation_history: Vec<Message>,
    /// Model override; the service default is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Opaque requester identifier, kept for logging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl ChatPayload {
    /// Creates a payload with just a prompt.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            conversation_history: Vec::new(),
            model: None,
            user_id: None,
        }
    }

    /// Sets the prior conversation.
    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.conversation_history = history;
        self
    }

    /// Sets the model override.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the requester identifier.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Checks the payload against the schema rules.
    pub fn validate(&self, limits: &PayloadLimits) -> Result<(), ValidationError> {
        if self.prompt.trim().is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }
        if self.prompt.chars().count() > limits.max_prompt_chars {
            return Err(ValidationError::PromptTooLong {
                limit: limits.max_prompt_chars,
            });
        }
        if self.conversation_history.len() > limits.max_history {
            return Err(ValidationError::HistoryTooLong {
                limit: limits.max_history,
            });
        }
        if let Some((index, message)) = self
            .conversation_history
            .iter()
            .enumerate()
            .find(|(_, m)| m.role == Role::System)
        {
            return Err(ValidationError::InvalidRole {
                index,
                role: message.role.to_string(),
            });
        }
        if let Some(model) = &self.model {
            if model.trim().is_empty() || model.chars().any(char::is_whitespace) {
                return Err(ValidationError::InvalidModel(model.clone()));
            }
        }
        Ok(())
    }
}

/// Checks that a priority lies within the accepted range.
pub fn validate_priority(priority: i32) -> Result<(), ValidationError> {
    if !(-PRIORITY_LIMIT..=PRIORITY_LIMIT).contains(&priority) {
        return Err(ValidationError::PriorityOutOfRange {
            priority,
            min: -PRIORITY_LIMIT,
            max: PRIORITY_LIMIT,
        });
    }
    Ok(())
}

/// Attempt budget and backoff between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of execution attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Growth factor applied per further attempt.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Sets the maximum number of attempts (at least one).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before re-eligibility after the given (1-based) failed attempt.
    ///
    /// `base * multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Lifecycle status of a task, without state data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Queued, possibly delayed by a retry backoff.
    Waiting,
    /// Claimed by a worker.
    Active,
    /// Finished with a result.
    Completed,
    /// Finished without a result.
    Failed,
}

impl TaskStatus {
    /// Returns whether no further transitions can occur.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Waiting => write!(f, "waiting"),
            TaskStatus::Active => write!(f, "active"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Output of a completed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    /// Generated text.
    pub response: String,
    /// Model that produced it.
    pub model: String,
    /// When the task completed.
    pub completed_at: DateTime<Utc>,
    /// Worker that ran the final attempt.
    pub worker_id: String,
    /// Duration of the final attempt in milliseconds.
    pub duration_ms: u64,
}

/// Task state; each variant carries only the data valid in that state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Waiting {
        /// Earliest claim time after a retry backoff.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        eligible_at: Option<DateTime<Utc>>,
    },
    Active {
        progress: u8,
        started_at: DateTime<Utc>,
        worker_id: String,
    },
    Completed {
        result: TaskResult,
    },
    Failed {
        reason: String,
        failed_at: DateTime<Utc>,
    },
}

/// Rejected state transition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Cannot {action} task {task_id} in state '{from}'")]
pub struct TransitionError {
    pub task_id: Uuid,
    pub from: TaskStatus,
    pub action: &'static str,
}

/// What a failed attempt turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `Waiting`, claimable from `eligible_at`.
    Retry {
        eligible_at: DateTime<Utc>,
        delay: Duration,
    },
    /// Attempt budget exhausted (or failure was permanent).
    Failed,
}

/// A unit of enqueued generation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, assigned at enqueue.
    pub id: Uuid,
    /// What to generate.
    pub payload: ChatPayload,
    /// Higher values are claimed first.
    pub priority: i32,
    /// Enqueue order, assigned by the store; breaks priority ties FIFO.
    pub sequence: u64,
    /// Execution attempts made so far.
    pub attempts: u32,
    /// Attempt budget and backoff.
    pub retry: RetryPolicy,
    /// When the task was enqueued.
    pub created_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub state: TaskState,
}

impl Task {
    /// Creates a new waiting task with a fresh id.
    pub fn new(payload: ChatPayload, priority: i32, retry: RetryPolicy) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            priority,
            sequence: 0,
            attempts: 0,
            retry,
            created_at: Utc::now(),
            state: TaskState::Waiting { eligible_at: None },
        }
    }

    /// Returns the status without state data.
    pub fn status(&self) -> TaskStatus {
        match self.state {
            TaskState::Waiting { .. } => TaskStatus::Waiting,
            TaskState::Active { .. } => TaskStatus::Active,
            TaskState::Completed { .. } => TaskStatus::Completed,
            TaskState::Failed { .. } => TaskStatus::Failed,
        }
    }

    /// Returns whether the task reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Progress percentage: 0 while waiting or failed, 100 once completed.
    pub fn progress(&self) -> u8 {
        match &self.state {
            TaskState::Active { progress, .. } => *progress,
            TaskState::Completed { .. } => 100,
            TaskState::Waiting { .. } | TaskState::Failed { .. } => 0,
        }
    }

    /// The result, present only when completed.
    pub fn result(&self) -> Option<&TaskResult> {
        match &self.state {
            TaskState::Completed { result } => Some(result),
            _ => None,
        }
    }

    /// The failure reason, present only when failed.
    pub fn failure_reason(&self) -> Option<&str> {
        match &self.state {
            TaskState::Failed { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// When the task reached its terminal state.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            TaskState::Completed { result } => Some(result.completed_at),
            TaskState::Failed { failed_at, .. } => Some(*failed_at),
            _ => None,
        }
    }

    /// Earliest claim time, if the task is waiting out a backoff.
    pub fn eligible_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            TaskState::Waiting { eligible_at } => *eligible_at,
            _ => None,
        }
    }

    /// Returns the number of remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.retry.max_attempts.saturating_sub(self.attempts)
    }

    /// Ordering key for the waiting set: higher priority first, then FIFO.
    pub fn queue_rank(&self) -> (Reverse<i32>, u64) {
        (Reverse(self.priority), self.sequence)
    }

    /// The same ordering packed into a single score (lowest claims first).
    ///
    /// Exact in an `f64` while the priority is within [`PRIORITY_LIMIT`].
    pub fn rank_score(&self) -> f64 {
        let priority = self.priority.clamp(-PRIORITY_LIMIT, PRIORITY_LIMIT) as f64;
        let sequence = (self.sequence % SEQUENCE_SPAN as u64) as f64;
        -priority * SEQUENCE_SPAN + sequence
    }

    fn reject(&self, action: &'static str) -> TransitionError {
        TransitionError {
            task_id: self.id,
            from: self.status(),
            action,
        }
    }

    /// `Waiting -> Active`: starts a new attempt with progress reset to 0.
    pub fn claim(&mut self, worker_id: &str, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.state {
            TaskState::Waiting { .. } if self.attempts < self.retry.max_attempts => {
                self.attempts += 1;
                self.state = TaskState::Active {
                    progress: 0,
                    started_at: now,
                    worker_id: worker_id.to_string(),
                };
                Ok(())
            }
            _ => Err(self.reject("claim")),
        }
    }

    /// Raises progress of an active task.
    ///
    /// The value is clamped to `[0, 100]`; values below the current progress
    /// are ignored. Returns the progress after the update.
    pub fn advance(&mut self, percent: i32) -> Result<u8, TransitionError> {
        let clamped = percent.clamp(0, 100) as u8;
        match &mut self.state {
            TaskState::Active { progress, .. } => {
                if clamped > *progress {
                    *progress = clamped;
                }
                Ok(*progress)
            }
            _ => Err(self.reject("report progress for")),
        }
    }

    /// `Active -> Completed`.
    pub fn complete(&mut self, result: TaskResult) -> Result<(), TransitionError> {
        match self.state {
            TaskState::Active { .. } => {
                self.state = TaskState::Completed { result };
                Ok(())
            }
            _ => Err(self.reject("complete")),
        }
    }

    /// `Active -> Waiting` (delayed) while attempts remain, else `Active -> Failed`.
    pub fn fail(
        &mut self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, TransitionError> {
        if !matches!(self.state, TaskState::Active { .. }) {
            return Err(self.reject("fail"));
        }

        if self.attempts < self.retry.max_attempts {
            let delay = self.retry.backoff(self.attempts);
            let eligible_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
            self.state = TaskState::Waiting {
                eligible_at: Some(eligible_at),
            };
            Ok(FailureOutcome::Retry { eligible_at, delay })
        } else {
            self.state = TaskState::Failed {
                reason: reason.to_string(),
                failed_at: now,
            };
            Ok(FailureOutcome::Failed)
        }
    }

    /// `Active -> Failed` regardless of remaining attempts.
    pub fn fail_permanently(
        &mut self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        match self.state {
            TaskState::Active { .. } => {
                self.state = TaskState::Failed {
                    reason: reason.to_string(),
                    failed_at: now,
                };
                Ok(())
            }
            _ => Err(self.reject("fail")),
        }
    }

    /// Point-in-time view for observers.
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id,
            state: self.status(),
            progress: self.progress(),
            result: self.result().cloned(),
            failed_reason: self.failure_reason().map(str::to_string),
            attempts: self.attempts,
            max_attempts: self.retry.max_attempts,
            priority: self.priority,
            created_at: self.created_at,
            user_id: self.payload.user_id.clone(),
            model: self.payload.model.clone(),
        }
    }
}

/// Point-in-time view of a task, as returned by status queries and streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub task_id: Uuid,
    pub state: TaskStatus,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_task(max_attempts: u32) -> Task {
        let mut task = Task::new(
            ChatPayload::new("hello"),
            5,
            RetryPolicy::default().with_max_attempts(max_attempts),
        );
        task.claim("worker-0", Utc::now()).expect("claim should succeed");
        task
    }

    fn result() -> TaskResult {
        TaskResult {
            response: "hi there".to_string(),
            model: "qwen3:latest".to_string(),
            completed_at: Utc::now(),
            worker_id: "worker-0".to_string(),
            duration_ms: 12,
        }
    }

    #[test]
    fn test_payload_validation() {
        let limits = PayloadLimits::default();
        assert!(ChatPayload::new("hello").validate(&limits).is_ok());
        assert_eq!(
            ChatPayload::new("   ").validate(&limits),
            Err(ValidationError::EmptyPrompt)
        );

        let long = "x".repeat(limits.max_prompt_chars + 1);
        assert!(matches!(
            ChatPayload::new(long).validate(&limits),
            Err(ValidationError::PromptTooLong { .. })
        ));

        let with_system = ChatPayload::new("q")
            .with_history(vec![Message::user("a"), Message::system("override")]);
        assert_eq!(
            with_system.validate(&limits),
            Err(ValidationError::InvalidRole {
                index: 1,
                role: "system".to_string()
            })
        );

        let bad_model = ChatPayload::new("q").with_model("qwen 3");
        assert!(matches!(
            bad_model.validate(&limits),
            Err(ValidationError::InvalidModel(_))
        ));
    }

    #[test]
    fn test_priority_range() {
        assert!(validate_priority(0).is_ok());
        assert!(validate_priority(PRIORITY_LIMIT).is_ok());
        assert!(validate_priority(-PRIORITY_LIMIT).is_ok());
        assert!(validate_priority(PRIORITY_LIMIT + 1).is_err());
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_millis(2000))
            .with_multiplier(2.0)
            .with_max_delay(Duration::from_millis(10_000));

        assert_eq!(policy.backoff(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff(3), Duration::from_millis(8000));
        assert_eq!(policy.backoff(4), Duration::from_millis(10_000));
    }

    #[test]
    fn test_claim_resets_progress_and_counts_attempt() {
        let mut task = active_task(3);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.advance(40), Ok(40));

        let outcome = task.fail("boom", Utc::now()).expect("fail");
        assert!(matches!(outcome, FailureOutcome::Retry { .. }));
        assert_eq!(task.status(), TaskStatus::Waiting);
        assert_eq!(task.progress(), 0);

        task.claim("worker-1", Utc::now()).expect("reclaim");
        assert_eq!(task.attempts, 2);
        assert_eq!(task.progress(), 0);
    }

    #[test]
    fn test_progress_is_clamped_and_monotonic() {
        let mut task = active_task(3);
        assert_eq!(task.advance(-5), Ok(0));
        assert_eq!(task.advance(30), Ok(30));
        assert_eq!(task.advance(20), Ok(30));
        assert_eq!(task.advance(250), Ok(100));
    }

    #[test]
    fn test_complete_sets_result_and_progress() {
        let mut task = active_task(3);
        task.complete(result()).expect("complete");

        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.progress(), 100);
        assert!(task.result().is_some());
        assert!(task.failure_reason().is_none());
    }

    #[test]
    fn test_retry_exhaustion_ends_failed() {
        let mut task = active_task(2);
        assert!(matches!(
            task.fail("first", Utc::now()),
            Ok(FailureOutcome::Retry { .. })
        ));
        task.claim("worker-0", Utc::now()).expect("second attempt");
        assert_eq!(task.fail("second", Utc::now()), Ok(FailureOutcome::Failed));

        assert_eq!(task.attempts, 2);
        assert_eq!(task.failure_reason(), Some("second"));
        assert!(task.result().is_none());
        assert!(task.claim("worker-0", Utc::now()).is_err());
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let mut task = active_task(3);
        task.complete(result()).expect("complete");

        let err = task.claim("worker-0", Utc::now()).expect_err("completed -> active");
        assert_eq!(err.from, TaskStatus::Completed);
        assert!(task.advance(10).is_err());
        assert!(task.fail("late", Utc::now()).is_err());
        assert!(task.complete(result()).is_err());
    }

    #[test]
    fn test_permanent_failure_ignores_budget() {
        let mut task = active_task(5);
        task.fail_permanently("empty prompt", Utc::now())
            .expect("fail permanently");
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.remaining_attempts(), 4);
    }

    #[test]
    fn test_rank_orders_priority_then_fifo() {
        let mut low = Task::new(ChatPayload::new("a"), 1, RetryPolicy::default());
        low.sequence = 1;
        let mut high = Task::new(ChatPayload::new("b"), 10, RetryPolicy::default());
        high.sequence = 2;
        let mut high_later = Task::new(ChatPayload::new("c"), 10, RetryPolicy::default());
        high_later.sequence = 3;

        assert!(high.queue_rank() < high_later.queue_rank());
        assert!(high_later.queue_rank() < low.queue_rank());
        assert!(high.rank_score() < high_later.rank_score());
        assert!(high_later.rank_score() < low.rank_score());
    }

    #[test]
    fn test_task_serialization_keeps_state_tag() {
        let task = active_task(3);
        let json = serde_json::to_value(&task).expect("serialize");
        assert_eq!(json["state"]["state"], "active");

        let parsed: Task = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, task);
    }

    #[test]
    fn test_snapshot_fields() {
        let mut task = active_task(3);
        task.payload.user_id = Some("user-1".into());
        task.fail_permanently("bad", Utc::now()).expect("fail");

        let snapshot = task.snapshot();
        assert_eq!(snapshot.state, TaskStatus::Failed);
        assert_eq!(snapshot.failed_reason.as_deref(), Some("bad"));
        assert_eq!(snapshot.user_id.as_deref(), Some("user-1"));

        let json = serde_json::to_value(&snapshot).expect("serialize");
        assert_eq!(json["state"], "failed");
        assert_eq!(json["failedReason"], "bad");
        assert!(json.get("result").is_none());
    }
}
