//! Service configuration.
//!
//! Plain structs with defaults and builder methods; the CLI fills them from
//! flags and environment variables.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::llm::ollama::DEFAULT_OLLAMA_URL;
use crate::scheduler::{RetentionPolicy, RetryPolicy, WorkerPoolConfig};
use crate::status::StatusHubConfig;

/// Default queue name, shared by every process serving the same queue.
pub const DEFAULT_QUEUE_NAME: &str = "ai-chat-queue";

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 3001;

/// Default system prompt.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant. Answer questions concisely and helpfully.";

/// Errors raised by inconsistent configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid bind address '{0}'")]
    InvalidBindAddress(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Which task store to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StoreKind {
    /// Shared Redis store; required for more than one process.
    Redis,
    /// In-process store; tasks are lost on restart.
    Memory,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Redis => write!(f, "redis"),
            StoreKind::Memory => write!(f, "memory"),
        }
    }
}

/// Which generation backend to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    /// Ollama `/api/chat` (NDJSON streaming).
    Ollama,
    /// OpenAI-compatible `/chat/completions` (SSE streaming).
    #[value(name = "openai")]
    OpenAi,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Ollama => write!(f, "ollama"),
            BackendKind::OpenAi => write!(f, "openai"),
        }
    }
}

/// Where tasks are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub redis_url: String,
    pub queue_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Redis,
            redis_url: redis_url_from_parts("localhost", 6379, None),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
        }
    }
}

/// How to reach the generation backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub url: String,
    pub api_key: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Ollama,
            url: DEFAULT_OLLAMA_URL.to_string(),
            api_key: None,
        }
    }
}

/// Complete configuration of a running service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Host/IP the HTTP server binds to.
    pub bind_host: String,
    /// HTTP port.
    pub port: u16,
    pub store: StoreConfig,
    pub backend: BackendConfig,
    pub pool: WorkerPoolConfig,
    /// Retry policy given to newly submitted tasks.
    pub retry: RetryPolicy,
    pub status: StatusHubConfig,
    pub retention: RetentionPolicy,
    /// How often the janitor purges finished tasks.
    pub purge_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            store: StoreConfig::default(),
            backend: BackendConfig::default(),
            pool: WorkerPoolConfig::default().with_system_prompt(DEFAULT_SYSTEM_PROMPT),
            retry: RetryPolicy::default(),
            status: StatusHubConfig::default(),
            retention: RetentionPolicy::default(),
            purge_interval: Duration::from_secs(60),
        }
    }
}

impl ServiceConfig {
    /// Sets the bind host and port.
    pub fn with_bind(mut self, host: impl Into<String>, port: u16) -> Self {
        self.bind_host = host.into();
        self.port = port;
        self
    }

    /// Sets the store configuration.
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Sets the backend configuration.
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the worker pool configuration.
    pub fn with_pool(mut self, pool: WorkerPoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Sets the retry policy for new tasks.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the status cadence.
    pub fn with_status(mut self, status: StatusHubConfig) -> Self {
        self.status = status;
        self
    }

    /// Sets the retention policy and purge interval.
    pub fn with_retention(mut self, retention: RetentionPolicy, purge_interval: Duration) -> Self {
        self.retention = retention;
        self.purge_interval = purge_interval;
        self
    }

    /// Resolves the HTTP bind address; host names go through DNS.
    pub async fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = format!("{}:{}", self.bind_host, self.port);
        let mut addrs = tokio::net::lookup_host((self.bind_host.as_str(), self.port))
            .await
            .map_err(|_| ConfigError::InvalidBindAddress(raw.clone()))?;
        addrs
            .next()
            .ok_or(ConfigError::InvalidBindAddress(raw))
    }

    /// Rejects values the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.num_workers == 0 {
            return Err(invalid("concurrency", "must be at least 1"));
        }
        if self.pool.rate_limit_max == 0 {
            return Err(invalid("rate limit max", "must be at least 1"));
        }
        if self.pool.rate_limit_window.is_zero() {
            return Err(invalid("rate limit window", "must be positive"));
        }
        if self.pool.poll_interval.is_zero() || self.status.poll_interval.is_zero() {
            return Err(invalid("poll interval", "must be positive"));
        }
        if self.status.heartbeat_interval.is_zero() {
            return Err(invalid("heartbeat interval", "must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("max attempts", "must be at least 1"));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(invalid("backoff multiplier", "must be a finite number >= 1.0"));
        }
        if self.pool.default_model.trim().is_empty() {
            return Err(invalid("default model", "must not be empty"));
        }
        if self.bind_host.trim().is_empty() {
            return Err(ConfigError::InvalidBindAddress(format!(":{}", self.port)));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

/// Builds a Redis URL from host, port and optional password.
///
/// The password is percent-encoded so reserved characters survive parsing.
pub fn redis_url_from_parts(host: &str, port: u16, password: Option<&str>) -> String {
    match password.filter(|p| !p.is_empty()) {
        Some(password) => format!(
            "redis://:{}@{}:{}",
            urlencoding::encode(password),
            host,
            port
        ),
        None => format!("redis://{}:{}", host, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.port, 3001);
        assert_eq!(config.store.queue_name, "ai-chat-queue");
        assert_eq!(config.store.redis_url, "redis://localhost:6379");
        assert_eq!(config.pool.num_workers, 3);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(
            config.pool.system_prompt.as_deref(),
            Some(DEFAULT_SYSTEM_PROMPT)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_redis_url_from_parts() {
        assert_eq!(
            redis_url_from_parts("cache", 6380, Some("s3cret")),
            "redis://:s3cret@cache:6380"
        );
        assert_eq!(redis_url_from_parts("cache", 6380, Some("")), "redis://cache:6380");
    }

    #[test]
    fn test_redis_url_encodes_reserved_password_characters() {
        let url = redis_url_from_parts("cache", 6379, Some("p@ss/w#rd:x"));
        assert_eq!(url, "redis://:p%40ss%2Fw%23rd%3Ax@cache:6379");

        let info = redis::Client::open(url.as_str())
            .expect("url should parse")
            .get_connection_info()
            .clone();
        assert_eq!(info.redis.password.as_deref(), Some("p@ss/w#rd:x"));
        assert_eq!(info.redis.db, 0);
    }

    #[tokio::test]
    async fn test_socket_addr() {
        let config = ServiceConfig::default().with_bind("127.0.0.1", 8080);
        assert_eq!(
            config.socket_addr().await.expect("valid"),
            "127.0.0.1:8080".parse::<SocketAddr>().expect("addr")
        );

        let named = ServiceConfig::default().with_bind("localhost", 8080);
        let addr = named.socket_addr().await.expect("localhost resolves");
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 8080);

        let bad = ServiceConfig::default().with_bind("not a host", 80);
        assert!(matches!(
            bad.socket_addr().await,
            Err(ConfigError::InvalidBindAddress(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_bind_host() {
        let config = ServiceConfig::default().with_bind(" ", 80);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBindAddress(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = ServiceConfig::default().with_pool(WorkerPoolConfig::new(0));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "concurrency", .. })
        ));
    }

    #[test]
    fn test_validate_rejects_shrinking_backoff() {
        let config =
            ServiceConfig::default().with_retry(RetryPolicy::default().with_multiplier(0.5));
        assert!(config.validate().is_err());
    }
}
