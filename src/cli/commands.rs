//! CLI command definitions for chat-queue.
//!
//! `serve` runs the HTTP surface together with the worker pool; `submit`,
//! `status` and `stats` talk to the task store directly.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use tracing::{info, warn};

use crate::api::{QueueApi, SubmitRequest};
use crate::config::{
    redis_url_from_parts, BackendConfig, BackendKind, ServiceConfig, StoreConfig, StoreKind,
    DEFAULT_PORT, DEFAULT_QUEUE_NAME, DEFAULT_SYSTEM_PROMPT,
};
use crate::scheduler::{RetentionPolicy, RetryPolicy, WorkerPoolConfig};
use crate::service::{connect_store, ChatQueueService};
use crate::status::{StatusEvent, StatusHub, StatusHubConfig};

/// Default model used when a task does not name one.
const DEFAULT_MODEL: &str = "qwen3:latest";

/// Queue-backed chat generation service.
#[derive(Parser)]
#[command(name = "chat-queue")]
#[command(about = "Prioritized, rate-limited chat generation queue with live status streams")]
#[command(version)]
#[command(
    long_about = "chat-queue accepts chat prompts over HTTP, stores them in a priority queue and answers them with a pool of workers streaming from Ollama or an OpenAI-compatible backend.\n\nExample usage:\n  chat-queue serve --concurrency 3 --rate-limit-max 10\n  chat-queue submit \"Explain backpressure\" --priority 5 --watch"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the HTTP API and the worker pool.
    Serve(Box<ServeArgs>),

    /// Enqueue a prompt directly into the store.
    Submit(SubmitArgs),

    /// Print the current snapshot of a task.
    Status(StatusArgs),

    /// Print per-state task counts.
    Stats(StatsArgs),
}

/// Where the task store lives.
#[derive(clap::Args, Debug, Clone)]
pub struct StoreArgs {
    /// Task store backend.
    #[arg(long, env = "QUEUE_STORE", value_enum, default_value_t = StoreKind::Redis)]
    pub store: StoreKind,

    /// Full Redis URL; overrides host, port and password.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Redis host.
    #[arg(long, env = "REDIS_HOST", default_value = "localhost")]
    pub redis_host: String,

    /// Redis port.
    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    pub redis_port: u16,

    /// Redis password.
    #[arg(long, env = "REDIS_PASSWORD")]
    pub redis_password: Option<String>,

    /// Queue name; processes sharing a name share tasks.
    #[arg(long, env = "QUEUE_NAME", default_value = DEFAULT_QUEUE_NAME)]
    pub queue_name: String,
}

impl StoreArgs {
    pub fn to_config(&self) -> StoreConfig {
        let redis_url = self.redis_url.clone().unwrap_or_else(|| {
            redis_url_from_parts(
                &self.redis_host,
                self.redis_port,
                self.redis_password.as_deref(),
            )
        });
        StoreConfig {
            kind: self.store,
            redis_url,
            queue_name: self.queue_name.clone(),
        }
    }
}

/// Retry policy given to submitted tasks.
#[derive(clap::Args, Debug, Clone)]
pub struct RetryArgs {
    /// Attempts per task, including the first.
    #[arg(long, env = "MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    #[arg(long, env = "BACKOFF_BASE_MS", default_value_t = 2000)]
    pub backoff_base_ms: u64,

    /// Factor applied to the delay on every further retry.
    #[arg(long, env = "BACKOFF_MULTIPLIER", default_value_t = 2.0)]
    pub backoff_multiplier: f64,

    /// Upper bound for a retry delay, in milliseconds.
    #[arg(long, env = "BACKOFF_MAX_MS", default_value_t = 60_000)]
    pub backoff_max_ms: u64,
}

impl RetryArgs {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_base_delay(Duration::from_millis(self.backoff_base_ms))
            .with_multiplier(self.backoff_multiplier)
            .with_max_delay(Duration::from_millis(self.backoff_max_ms))
    }
}

/// Arguments for the serve command.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub retry: RetryArgs,

    /// Address the HTTP server binds to.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    pub bind: String,

    /// HTTP port.
    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Generation backend.
    #[arg(long, env = "GENERATION_BACKEND", value_enum, default_value_t = BackendKind::Ollama)]
    pub backend: BackendKind,

    /// Backend base URL; defaults to the Ollama host and port.
    #[arg(long, env = "OLLAMA_URL")]
    pub backend_url: Option<String>,

    /// Ollama host, used when no backend URL is given.
    #[arg(long, env = "OLLAMA_HOST", default_value = "localhost")]
    pub ollama_host: String,

    /// Ollama port, used when no backend URL is given.
    #[arg(long, env = "OLLAMA_PORT", default_value_t = 11434)]
    pub ollama_port: u16,

    /// Bearer token for OpenAI-compatible backends.
    #[arg(long, env = "LLM_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Model used when a task does not name one.
    #[arg(short, long, env = "DEFAULT_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// System prompt sent ahead of every conversation.
    #[arg(long, env = "SYSTEM_PROMPT", default_value = DEFAULT_SYSTEM_PROMPT)]
    pub system_prompt: String,

    /// Number of workers (maximum concurrent generations).
    #[arg(short, long, env = "WORKER_CONCURRENCY", default_value_t = 3)]
    pub concurrency: usize,

    /// Task starts admitted per rate-limit window.
    #[arg(long, env = "RATE_LIMIT_MAX", default_value_t = 10)]
    pub rate_limit_max: usize,

    /// Rate-limit window, in milliseconds.
    #[arg(long, env = "RATE_LIMIT_WINDOW_MS", default_value_t = 60_000)]
    pub rate_limit_window_ms: u64,

    /// Maximum duration of one attempt, in seconds.
    #[arg(long, env = "JOB_TIMEOUT_SECS", default_value_t = 300)]
    pub job_timeout_secs: u64,

    /// Idle poll interval of the workers, in milliseconds.
    #[arg(long, env = "WORKER_POLL_INTERVAL_MS", default_value_t = 500)]
    pub poll_interval_ms: u64,

    /// Poll interval of status subscriptions, in milliseconds.
    #[arg(long, env = "STATUS_POLL_MS", default_value_t = 500)]
    pub status_poll_ms: u64,

    /// Idle time before a heartbeat, in seconds.
    #[arg(long, env = "HEARTBEAT_SECS", default_value_t = 15)]
    pub heartbeat_secs: u64,

    /// Age after which completed tasks are purged, in seconds.
    #[arg(long, env = "RETAIN_COMPLETED_SECS", default_value_t = 3600)]
    pub retain_completed_secs: u64,

    /// Number of most recent completed tasks kept.
    #[arg(long, env = "RETAIN_COMPLETED_COUNT", default_value_t = 100)]
    pub retain_completed_count: usize,

    /// Age after which failed tasks are purged, in seconds.
    #[arg(long, env = "RETAIN_FAILED_SECS", default_value_t = 86_400)]
    pub retain_failed_secs: u64,

    /// How often finished tasks are purged, in seconds.
    #[arg(long, env = "PURGE_INTERVAL_SECS", default_value_t = 60)]
    pub purge_interval_secs: u64,

    /// Grace period for running tasks on shutdown, in seconds.
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    pub shutdown_timeout_secs: u64,
}

impl ServeArgs {
    /// Assembles the service configuration.
    pub fn to_config(&self) -> ServiceConfig {
        let backend_url = self
            .backend_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.ollama_host, self.ollama_port));

        let system_prompt = self.system_prompt.trim();
        let mut pool = WorkerPoolConfig::new(self.concurrency)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_job_timeout(Duration::from_secs(self.job_timeout_secs))
            .with_shutdown_timeout(Duration::from_secs(self.shutdown_timeout_secs))
            .with_rate_limit(
                self.rate_limit_max,
                Duration::from_millis(self.rate_limit_window_ms),
            )
            .with_default_model(self.model.clone());
        if !system_prompt.is_empty() {
            pool = pool.with_system_prompt(system_prompt);
        }

        let retention = RetentionPolicy {
            completed_max_age: Duration::from_secs(self.retain_completed_secs),
            completed_max_count: Some(self.retain_completed_count),
            failed_max_age: Duration::from_secs(self.retain_failed_secs),
            failed_max_count: None,
        };

        ServiceConfig::default()
            .with_bind(self.bind.clone(), self.port)
            .with_store(self.store.to_config())
            .with_backend(BackendConfig {
                kind: self.backend,
                url: backend_url,
                api_key: self.api_key.clone().filter(|k| !k.is_empty()),
            })
            .with_pool(pool)
            .with_retry(self.retry.to_policy())
            .with_status(StatusHubConfig {
                poll_interval: Duration::from_millis(self.status_poll_ms),
                heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            })
            .with_retention(retention, Duration::from_secs(self.purge_interval_secs))
    }
}

/// Arguments for the submit command.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub retry: RetryArgs,

    /// The prompt to answer.
    pub prompt: String,

    /// Priority; higher runs first.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub priority: i32,

    /// Model override for this task.
    #[arg(short, long)]
    pub model: Option<String>,

    /// Caller id stored with the task.
    #[arg(long)]
    pub user_id: Option<String>,

    /// Follow the task's status until it finishes.
    #[arg(short, long)]
    pub watch: bool,

    /// Poll interval while watching, in milliseconds.
    #[arg(long, env = "STATUS_POLL_MS", default_value_t = 500)]
    pub status_poll_ms: u64,
}

/// Arguments for the status command.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Task id returned by submit.
    pub id: String,
}

/// Arguments for the stats command.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    #[command(flatten)]
    pub store: StoreArgs,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => run_serve_command(*args).await,
        Commands::Submit(args) => run_submit_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
        Commands::Stats(args) => run_stats_command(args).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_serve_command(args: ServeArgs) -> anyhow::Result<()> {
    let config = args.to_config();
    info!(
        store = %config.store.kind,
        queue = %config.store.queue_name,
        backend = %config.backend.kind,
        backend_url = %config.backend.url,
        model = %config.pool.default_model,
        concurrency = config.pool.num_workers,
        "Starting chat-queue"
    );

    let service = ChatQueueService::start(config).await?;
    service
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            info!("Shutdown signal received");
        })
        .await?;
    Ok(())
}

async fn open_api(
    store: &StoreArgs,
    retry: RetryPolicy,
    status: StatusHubConfig,
) -> anyhow::Result<QueueApi> {
    let config = store.to_config();
    if config.kind == StoreKind::Memory {
        warn!("The memory store is private to this process; no server will see these tasks");
    }
    let store = connect_store(&config).await?;
    let hub = StatusHub::new(Arc::clone(&store), status);
    Ok(QueueApi::new(store, hub, retry))
}

async fn run_submit_command(args: SubmitArgs) -> anyhow::Result<()> {
    let status = StatusHubConfig {
        poll_interval: Duration::from_millis(args.status_poll_ms),
        ..StatusHubConfig::default()
    };
    let api = open_api(&args.store, args.retry.to_policy(), status).await?;

    let request = SubmitRequest {
        prompt: Some(args.prompt),
        priority: Some(args.priority),
        model: args.model,
        user_id: args.user_id,
        ..SubmitRequest::default()
    };
    let response = api.submit(request).await?;
    println!("{}", response.task_id);

    if !args.watch {
        return Ok(());
    }

    let mut events = api.subscribe(&response.task_id.to_string());
    while let Some(event) = events.next().await {
        if matches!(event, StatusEvent::Heartbeat { .. }) {
            continue;
        }
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let api = open_api(&args.store, RetryPolicy::default(), StatusHubConfig::default()).await?;
    let snapshot = api.status(&args.id).await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn run_stats_command(args: StatsArgs) -> anyhow::Result<()> {
    let api = open_api(&args.store, RetryPolicy::default(), StatusHubConfig::default()).await?;
    let stats = api.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
