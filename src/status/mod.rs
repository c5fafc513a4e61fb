//! Status distribution: per-task subscription streams.
//!
//! Each subscription polls the store at a fixed interval and yields a
//! [`StatusEvent`] only when the task's state or progress changed since the
//! last one, plus a heartbeat after every idle heartbeat interval. The stream
//! ends after a terminal snapshot, a not-found event, or an error event.
//!
//! Subscriptions are counted per task in a [`SubscriberRegistry`]; the
//! retention janitor spares tasks that still have subscribers. Dropping a
//! stream (for example when the HTTP client disconnects) releases its timers
//! and its registry slot.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metrics::MetricsCollector;
use crate::scheduler::{TaskSnapshot, TaskStatus, TaskStore};

/// Stream of status events for one task.
pub type StatusStream = Pin<Box<dyn Stream<Item = StatusEvent> + Send>>;

/// Stream of result events for one task.
pub type ResultStream = Pin<Box<dyn Stream<Item = ResultEvent> + Send>>;

/// Event delivered to status subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    /// The task changed state or progress.
    Status(TaskSnapshot),
    /// Nothing changed for a while; the subscription is alive.
    Heartbeat { timestamp: DateTime<Utc> },
    /// No task with this id exists (or it was purged).
    NotFound {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    /// Polling failed; the subscription ends.
    Error { message: String },
}

impl StatusEvent {
    /// Event name used on the wire.
    pub fn event_name(&self) -> &'static str {
        match self {
            StatusEvent::Status(_) => "status",
            StatusEvent::Heartbeat { .. } => "heartbeat",
            StatusEvent::NotFound { .. } => "not_found",
            StatusEvent::Error { .. } => "error",
        }
    }

    /// Returns whether no further events follow this one.
    pub fn is_final(&self) -> bool {
        match self {
            StatusEvent::Status(snapshot) => snapshot.state.is_terminal(),
            StatusEvent::Heartbeat { .. } => false,
            StatusEvent::NotFound { .. } | StatusEvent::Error { .. } => true,
        }
    }
}

/// Event delivered on the result stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultEvent {
    /// Progress rose while the task is active.
    Progress { progress: u8 },
    /// The full generated text; always the last event on success.
    Chunk { content: String, done: bool },
    /// The task failed or does not exist.
    Error { message: String },
}

impl ResultEvent {
    /// Event name used on the wire.
    pub fn event_name(&self) -> &'static str {
        match self {
            ResultEvent::Progress { .. } => "progress",
            ResultEvent::Chunk { .. } => "chunk",
            ResultEvent::Error { .. } => "error",
        }
    }
}

/// Polling and heartbeat cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusHubConfig {
    /// How often each subscription reads the task.
    pub poll_interval: Duration,
    /// Idle time after which a heartbeat is sent.
    pub heartbeat_interval: Duration,
}

impl Default for StatusHubConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// Open subscriptions per task.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    counts: Mutex<HashMap<Uuid, usize>>,
    metrics: MetricsCollector,
}

impl SubscriberRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscription; it lasts until the guard is dropped.
    pub fn register(self: &Arc<Self>, task_id: Uuid) -> SubscriptionGuard {
        let total = {
            let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
            *counts.entry(task_id).or_insert(0) += 1;
            counts.values().sum()
        };
        self.metrics.update_subscriptions(total);
        debug!(task_id = %task_id, subscriptions = total, "Subscription opened");

        SubscriptionGuard {
            registry: Arc::clone(self),
            task_id,
        }
    }

    fn release(&self, task_id: Uuid) {
        let total = {
            let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(count) = counts.get_mut(&task_id) {
                *count -= 1;
                if *count == 0 {
                    counts.remove(&task_id);
                }
            }
            counts.values().sum()
        };
        self.metrics.update_subscriptions(total);
        debug!(task_id = %task_id, subscriptions = total, "Subscription closed");
    }

    /// Ids with at least one open subscription.
    pub fn pinned(&self) -> HashSet<Uuid> {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.keys().copied().collect()
    }

    /// Open subscriptions for one task.
    pub fn subscribers(&self, task_id: Uuid) -> usize {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.get(&task_id).copied().unwrap_or(0)
    }

    /// Open subscriptions across all tasks.
    pub fn active_subscriptions(&self) -> usize {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.values().sum()
    }
}

/// Keeps a registry slot for as long as it lives.
#[derive(Debug)]
pub struct SubscriptionGuard {
    registry: Arc<SubscriberRegistry>,
    task_id: Uuid,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.registry.release(self.task_id);
    }
}

enum Tick {
    Poll,
    Heartbeat,
}

/// Hands out status and result streams for tasks in a store.
#[derive(Clone)]
pub struct StatusHub {
    store: Arc<dyn TaskStore>,
    registry: Arc<SubscriberRegistry>,
    config: StatusHubConfig,
}

impl StatusHub {
    /// Creates a hub reading from `store`.
    pub fn new(store: Arc<dyn TaskStore>, config: StatusHubConfig) -> Self {
        Self {
            store,
            registry: Arc::new(SubscriberRegistry::new()),
            config,
        }
    }

    /// The subscriber registry (for pinning tasks against purge).
    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// The hub's cadence.
    pub fn config(&self) -> StatusHubConfig {
        self.config
    }

    /// Opens a status subscription for `task_id`.
    ///
    /// The first poll happens immediately and always produces an event.
    pub fn subscribe(&self, task_id: Uuid) -> StatusStream {
        let store = Arc::clone(&self.store);
        let guard = self.registry.register(task_id);
        let poll_every = self.config.poll_interval;
        let heartbeat_every = self.config.heartbeat_interval;

        Box::pin(async_stream::stream! {
            let _guard = guard;
            let mut poll = tokio::time::interval(poll_every);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut heartbeat =
                tokio::time::interval_at(Instant::now() + heartbeat_every, heartbeat_every);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last: Option<(TaskStatus, u8)> = None;

            loop {
                let tick = tokio::select! {
                    _ = poll.tick() => Tick::Poll,
                    _ = heartbeat.tick() => Tick::Heartbeat,
                };

                match tick {
                    Tick::Heartbeat => {
                        yield StatusEvent::Heartbeat { timestamp: Utc::now() };
                    }
                    Tick::Poll => match store.get(task_id).await {
                        Ok(Some(task)) => {
                            let seen = (task.status(), task.progress());
                            if last == Some(seen) {
                                continue;
                            }
                            last = Some(seen);
                            heartbeat.reset();

                            let event = StatusEvent::Status(task.snapshot());
                            let done = event.is_final();
                            yield event;
                            if done {
                                break;
                            }
                        }
                        Ok(None) => {
                            yield StatusEvent::NotFound { task_id: task_id.to_string() };
                            break;
                        }
                        Err(e) => {
                            warn!(task_id = %task_id, error = %e, "Status poll failed; closing subscription");
                            yield StatusEvent::Error { message: e.to_string() };
                            break;
                        }
                    },
                }
            }
        })
    }

    /// Opens a result stream for `task_id`: progress while active, then the
    /// full text, or an error.
    pub fn subscribe_result(&self, task_id: Uuid) -> ResultStream {
        let store = Arc::clone(&self.store);
        let guard = self.registry.register(task_id);
        let poll_every = self.config.poll_interval;

        Box::pin(async_stream::stream! {
            let _guard = guard;
            let mut poll = tokio::time::interval(poll_every);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_progress = 0u8;

            loop {
                poll.tick().await;
                let task = match store.get(task_id).await {
                    Ok(Some(task)) => task,
                    Ok(None) => {
                        yield ResultEvent::Error { message: format!("Task {} not found", task_id) };
                        break;
                    }
                    Err(e) => {
                        warn!(task_id = %task_id, error = %e, "Result poll failed; closing stream");
                        yield ResultEvent::Error { message: e.to_string() };
                        break;
                    }
                };

                if let Some(result) = task.result() {
                    yield ResultEvent::Chunk { content: result.response.clone(), done: true };
                    break;
                }
                if let Some(reason) = task.failure_reason() {
                    yield ResultEvent::Error { message: reason.to_string() };
                    break;
                }
                if task.status() == TaskStatus::Active && task.progress() > last_progress {
                    last_progress = task.progress();
                    yield ResultEvent::Progress { progress: last_progress };
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{ChatPayload, MemoryTaskStore, RetryPolicy, TaskResult};
    use futures::StreamExt;

    fn fast_hub(store: Arc<MemoryTaskStore>) -> StatusHub {
        StatusHub::new(
            store,
            StatusHubConfig {
                poll_interval: Duration::from_millis(5),
                heartbeat_interval: Duration::from_secs(3600),
            },
        )
    }

    fn result() -> TaskResult {
        TaskResult {
            response: "answer".to_string(),
            model: "m".to_string(),
            completed_at: Utc::now(),
            worker_id: "w".to_string(),
            duration_ms: 5,
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = StatusEvent::NotFound {
            task_id: Uuid::nil().to_string(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "not_found");
        assert_eq!(json["taskId"], "00000000-0000-0000-0000-000000000000");

        let chunk = ResultEvent::Chunk {
            content: "x".into(),
            done: true,
        };
        let json = serde_json::to_value(&chunk).expect("serialize");
        assert_eq!(json["type"], "chunk");
        assert_eq!(json["done"], true);
    }

    #[test]
    fn test_registry_counts_and_pins() {
        let registry = Arc::new(SubscriberRegistry::new());
        let id = Uuid::new_v4();

        let first = registry.register(id);
        let second = registry.register(id);
        assert_eq!(registry.subscribers(id), 2);
        assert!(registry.pinned().contains(&id));

        drop(first);
        assert_eq!(registry.subscribers(id), 1);
        drop(second);
        assert_eq!(registry.active_subscriptions(), 0);
        assert!(registry.pinned().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_task_yields_not_found_and_closes() {
        let hub = fast_hub(Arc::new(MemoryTaskStore::new()));
        let id = Uuid::new_v4();

        let events: Vec<StatusEvent> = hub.subscribe(id).collect().await;
        assert_eq!(
            events,
            vec![StatusEvent::NotFound {
                task_id: id.to_string()
            }]
        );
        assert_eq!(hub.registry().active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_emits_only_changes_and_closes_on_terminal() {
        let store = Arc::new(MemoryTaskStore::new());
        let hub = fast_hub(store.clone());
        let id = store
            .enqueue(ChatPayload::new("q"), 0, RetryPolicy::default())
            .await
            .expect("enqueue");

        let mut stream = hub.subscribe(id);
        let first = stream.next().await.expect("first event");
        assert!(matches!(&first, StatusEvent::Status(s) if s.state == TaskStatus::Waiting));

        store.claim_next("w").await.expect("claim");
        store.report_progress(id, 40).await.expect("progress");
        let second = stream.next().await.expect("second event");
        assert!(matches!(&second, StatusEvent::Status(s) if s.state == TaskStatus::Active && s.progress == 40));

        store.complete(id, result()).await.expect("complete");
        let third = stream.next().await.expect("third event");
        assert!(third.is_final());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_when_idle() {
        let store = Arc::new(MemoryTaskStore::new());
        let hub = StatusHub::new(
            store.clone(),
            StatusHubConfig {
                poll_interval: Duration::from_millis(5),
                heartbeat_interval: Duration::from_millis(30),
            },
        );
        let id = store
            .enqueue(ChatPayload::new("q"), 0, RetryPolicy::default())
            .await
            .expect("enqueue");

        let mut stream = hub.subscribe(id);
        assert!(matches!(stream.next().await, Some(StatusEvent::Status(_))));
        assert!(matches!(
            stream.next().await,
            Some(StatusEvent::Heartbeat { .. })
        ));
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_subscription() {
        let store = Arc::new(MemoryTaskStore::new());
        let hub = fast_hub(store.clone());
        let id = store
            .enqueue(ChatPayload::new("q"), 0, RetryPolicy::default())
            .await
            .expect("enqueue");

        let mut stream = hub.subscribe(id);
        stream.next().await.expect("first event");
        assert_eq!(hub.registry().subscribers(id), 1);

        drop(stream);
        assert_eq!(hub.registry().subscribers(id), 0);
    }

    #[tokio::test]
    async fn test_result_stream_ends_with_full_text() {
        let store = Arc::new(MemoryTaskStore::new());
        let hub = fast_hub(store.clone());
        let id = store
            .enqueue(ChatPayload::new("q"), 0, RetryPolicy::default())
            .await
            .expect("enqueue");
        store.claim_next("w").await.expect("claim");
        store.report_progress(id, 30).await.expect("progress");

        let mut stream = hub.subscribe_result(id);
        assert_eq!(
            stream.next().await,
            Some(ResultEvent::Progress { progress: 30 })
        );

        store.complete(id, result()).await.expect("complete");
        assert_eq!(
            stream.next().await,
            Some(ResultEvent::Chunk {
                content: "answer".into(),
                done: true
            })
        );
        assert!(stream.next().await.is_none());
    }
}
