//! Service lifecycle.
//!
//! [`ChatQueueService`] owns everything a serving process needs: the task
//! store, the generation backend, the worker pool, the status hub and the
//! retention janitor. It is constructed once at startup and torn down
//! explicitly; nothing lives in global mutable state apart from the metrics
//! registry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api::http::{self, AppState};
use crate::api::QueueApi;
use crate::config::{BackendConfig, BackendKind, ConfigError, ServiceConfig, StoreConfig, StoreKind};
use crate::error::LlmError;
use crate::llm::{GenerationBackend, OllamaClient, OpenAiCompatClient};
use crate::metrics::init_metrics;
use crate::scheduler::{
    MemoryTaskStore, PoolError, PoolStats, PoolStatsHandle, QueueError, RedisTaskStore,
    RetentionPolicy, TaskStore, WorkerPool,
};
use crate::status::{StatusHub, SubscriberRegistry};

/// Errors raised while starting, serving or stopping the service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue store error: {0}")]
    Store(#[from] QueueError),

    #[error("Generation backend error: {0}")]
    Backend(#[from] LlmError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("HTTP server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opens the configured task store.
pub async fn connect_store(config: &StoreConfig) -> Result<Arc<dyn TaskStore>, ServiceError> {
    let store: Arc<dyn TaskStore> = match config.kind {
        StoreKind::Redis => {
            Arc::new(RedisTaskStore::connect(&config.redis_url, &config.queue_name).await?)
        }
        StoreKind::Memory => Arc::new(MemoryTaskStore::new()),
    };
    info!(store = store.name(), queue = %config.queue_name, "Task store ready");
    Ok(store)
}

/// Builds the configured generation backend.
pub fn build_backend(config: &BackendConfig) -> Result<Arc<dyn GenerationBackend>, ServiceError> {
    let backend: Arc<dyn GenerationBackend> = match config.kind {
        BackendKind::Ollama => Arc::new(OllamaClient::new(config.url.clone())?),
        BackendKind::OpenAi => Arc::new(OpenAiCompatClient::new(
            config.url.clone(),
            config.api_key.clone(),
        )?),
    };
    Ok(backend)
}

/// A running queue service.
pub struct ChatQueueService {
    config: ServiceConfig,
    api: QueueApi,
    pool: WorkerPool,
    janitor: Option<JoinHandle<()>>,
    janitor_shutdown: broadcast::Sender<()>,
}

impl ChatQueueService {
    /// Connects store and backend from configuration and starts the service.
    pub async fn start(config: ServiceConfig) -> Result<Self, ServiceError> {
        config.validate()?;
        let store = connect_store(&config.store).await?;
        let backend = build_backend(&config.backend)?;
        Self::from_parts(config, store, backend).await
    }

    /// Starts the service over an existing store and backend.
    pub async fn from_parts(
        config: ServiceConfig,
        store: Arc<dyn TaskStore>,
        backend: Arc<dyn GenerationBackend>,
    ) -> Result<Self, ServiceError> {
        init_metrics()?;

        let hub = StatusHub::new(Arc::clone(&store), config.status);
        let api = QueueApi::new(Arc::clone(&store), hub.clone(), config.retry.clone())
            .with_limits(config.pool.payload_limits);

        let mut pool = WorkerPool::new(config.pool.clone(), Arc::clone(&store), backend);
        pool.start().await?;

        let (janitor_shutdown, _) = broadcast::channel(1);
        let janitor = tokio::spawn(run_janitor(
            store,
            Arc::clone(hub.registry()),
            config.retention.clone(),
            config.purge_interval,
            janitor_shutdown.subscribe(),
        ));

        Ok(Self {
            config,
            api,
            pool,
            janitor: Some(janitor),
            janitor_shutdown,
        })
    }

    /// The queue API backed by this service.
    pub fn api(&self) -> &QueueApi {
        &self.api
    }

    /// Current worker pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Handle for reading pool statistics from other tasks.
    pub fn pool_stats_handle(&self) -> PoolStatsHandle {
        self.pool.stats_handle()
    }

    /// HTTP router for this service.
    pub fn router(&self) -> axum::Router {
        http::router(AppState::new(self.api.clone()).with_workers(self.pool.stats_handle()))
    }

    /// Serves HTTP until `signal` resolves, then shuts everything down.
    pub async fn serve<F>(mut self, signal: F) -> Result<(), ServiceError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.socket_addr().await?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(addr = %addr, "HTTP server listening");

        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(signal)
            .await;
        let stopped = self.shutdown().await;

        served?;
        stopped
    }

    /// Stops the janitor and the worker pool.
    pub async fn shutdown(&mut self) -> Result<(), ServiceError> {
        let _ = self.janitor_shutdown.send(());
        if let Some(janitor) = self.janitor.take() {
            if let Err(e) = janitor.await {
                warn!(error = %e, "Retention janitor ended abnormally");
            }
        }

        if self.pool.is_running() {
            self.pool.shutdown().await?;
        }
        info!("Service stopped");
        Ok(())
    }
}

/// Periodically purges finished tasks, sparing tasks with open subscriptions.
async fn run_janitor(
    store: Arc<dyn TaskStore>,
    registry: Arc<SubscriberRegistry>,
    retention: RetentionPolicy,
    every: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Retention janitor stopping");
                break;
            }
            _ = ticker.tick() => {
                match store.purge(&retention, &registry.pinned()).await {
                    Ok(0) => {}
                    Ok(purged) => info!(purged = purged, "Purged finished tasks"),
                    Err(e) => warn!(error = %e, "Purge failed"),
                }
            }
        }
    }
}
