//! Centralized configuration management for repoweaver
//!
//! Every setting has a safe default and can be overridden with a
//! `REPOWEAVER_*` environment variable. A TOML or YAML file can replace the
//! whole configuration through [`source::ConfigurationLoader`].
//!
//! Configuration follows a simple hierarchy:
//! 1. Safe defaults (defined as constants)
//! 2. Environment variable overrides
//! 3. Runtime validation

pub mod error;
pub mod source;
pub mod validation;

pub use error::{ConfigError, ConfigResult};

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// SAFE DEFAULTS
// =============================================================================

// Indexing settings
const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024; // 2 MiB
const DEFAULT_MAX_TRIGRAM_COUNT: u64 = 20_000;
const DEFAULT_REINDEX_INTERVAL_MS: u64 = 60 * 60 * 1000; // 1 hour
const DEFAULT_REINDEX_REPO_POLLING_INTERVAL_MS: u64 = 1000;
const DEFAULT_RESYNC_CONNECTION_INTERVAL_MS: u64 = 24 * 60 * 60 * 1000; // 24 hours
const DEFAULT_RESYNC_CONNECTION_POLLING_INTERVAL_MS: u64 = 1000;
const DEFAULT_MAX_REPO_INDEXING_JOB_CONCURRENCY: usize = 8;
const DEFAULT_MAX_REPO_GC_JOB_CONCURRENCY: usize = 8;
const DEFAULT_REPO_GC_GRACE_PERIOD_MS: u64 = 10 * 1000;
const DEFAULT_REPO_INDEX_TIMEOUT_MS: u64 = 2 * 60 * 60 * 1000; // 2 hours
const DEFAULT_INDEX_BUILDER_BINARY: &str = "zoekt-git-index";
const DEFAULT_LARGE_ORG_REPO_THRESHOLD: usize = 1000;

// Job queue
const DEFAULT_QUEUE_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_QUEUE_BACKOFF_MS: u64 = 5000;
const DEFAULT_QUEUE_MAX_STALLED_COUNT: u32 = 1;
const DEFAULT_QUEUE_VISIBILITY_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_QUEUE_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_QUEUE_STALLED_CHECK_INTERVAL_MS: u64 = 30_000;
const DEFAULT_WORKER_STOP_GRACE_PERIOD_MS: u64 = 5000;

// Distributed lock
const DEFAULT_LOCK_TTL_MS: u64 = 60_000;
const DEFAULT_LOCK_EXTENSION_THRESHOLD: f64 = 0.5; // extend once half the TTL is gone
const DEFAULT_LOCK_CONTENTION_RETRY_DELAY_MS: u64 = 5000;

// Database Configuration (safe local defaults)
const DEFAULT_DB_HOST: &str = "localhost";
const DEFAULT_DB_PORT: u16 = 5432;
const DEFAULT_DB_NAME: &str = "repoweaver";
const DEFAULT_DB_USER: &str = "repoweaver";
const DEFAULT_DB_PASSWORD: &str = "localdev123";
const DEFAULT_DB_SSL_MODE: &str = "disable";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_DB_MIN_CONNECTIONS: u32 = 2;
const DEFAULT_DB_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_DB_IDLE_TIMEOUT_SECONDS: u64 = 300; // 5 minutes
const DEFAULT_AUTO_MIGRATE: bool = true;

// Telemetry Configuration
const DEFAULT_TRACING_LEVEL: &str = "info";
const DEFAULT_JSON_LOGS: bool = false;
const DEFAULT_ENABLE_METRICS: bool = false;
const DEFAULT_METRICS_PORT: u16 = 9464;
const DEFAULT_TELEMETRY_SERVICE_NAME: &str = "repoweaver";

use sqlx::postgres::{PgConnectOptions, PgSslMode};

/// Read `key` and parse it, falling back to `default` when unset or unparsable
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Core configuration for the entire repoweaver process
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ApplicationConfig {
    /// Scheduling intervals, concurrency and index builder limits
    pub indexing: IndexingConfig,

    /// On-disk locations for working copies and index shards
    pub paths: PathsConfig,

    /// Durable job queue behaviour
    pub queue: QueueConfig,

    /// Per-repository lease settings
    pub lock: LockConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Telemetry and observability configuration
    pub telemetry: TelemetryConfig,

    /// Code host connections to keep in sync
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

/// Process-wide orchestrator settings, loaded once and read-mostly
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IndexingConfig {
    /// Files larger than this many bytes are skipped by the index builder
    pub max_file_size: u64,

    /// Files producing more trigrams than this are skipped by the index builder
    pub max_trigram_count: u64,

    /// A repository is due for reindexing this long after its last success
    pub reindex_interval_ms: u64,

    /// Scheduler tick
    pub reindex_repo_polling_interval_ms: u64,

    /// A connection is re-discovered this long after its last sync
    pub resync_connection_interval_ms: u64,

    /// Connection syncer tick
    pub resync_connection_polling_interval_ms: u64,

    /// Concurrent INDEX jobs per process
    pub max_repo_indexing_job_concurrency: usize,

    /// Concurrent CLEANUP jobs per process
    pub max_repo_garbage_collection_job_concurrency: usize,

    /// How long a repository with no connections survives before cleanup
    pub repo_garbage_collection_grace_period_ms: u64,

    /// Hard limit for a single job, and the window in which an active job
    /// blocks rescheduling of its repository
    pub repo_index_timeout_ms: u64,

    /// Index builder executable
    pub index_builder_binary: String,

    /// Orgs with more due repositories than this in one scheduling pass get
    /// a lower queue priority
    pub large_org_repo_threshold: usize,

    /// Optional token used to authenticate git network operations
    #[serde(default, skip_serializing)]
    pub auth_token: Option<String>,
}

impl IndexingConfig {
    /// Load configuration from environment variables with safe defaults
    pub fn from_env() -> Self {
        Self {
            max_file_size: env_parse("REPOWEAVER_MAX_FILE_SIZE", DEFAULT_MAX_FILE_SIZE),
            max_trigram_count: env_parse(
                "REPOWEAVER_MAX_TRIGRAM_COUNT",
                DEFAULT_MAX_TRIGRAM_COUNT,
            ),
            reindex_interval_ms: env_parse(
                "REPOWEAVER_REINDEX_INTERVAL_MS",
                DEFAULT_REINDEX_INTERVAL_MS,
            ),
            reindex_repo_polling_interval_ms: env_parse(
                "REPOWEAVER_REINDEX_REPO_POLLING_INTERVAL_MS",
                DEFAULT_REINDEX_REPO_POLLING_INTERVAL_MS,
            ),
            resync_connection_interval_ms: env_parse(
                "REPOWEAVER_RESYNC_CONNECTION_INTERVAL_MS",
                DEFAULT_RESYNC_CONNECTION_INTERVAL_MS,
            ),
            resync_connection_polling_interval_ms: env_parse(
                "REPOWEAVER_RESYNC_CONNECTION_POLLING_INTERVAL_MS",
                DEFAULT_RESYNC_CONNECTION_POLLING_INTERVAL_MS,
            ),
            max_repo_indexing_job_concurrency: env_parse(
                "REPOWEAVER_MAX_REPO_INDEXING_JOB_CONCURRENCY",
                DEFAULT_MAX_REPO_INDEXING_JOB_CONCURRENCY,
            ),
            max_repo_garbage_collection_job_concurrency: env_parse(
                "REPOWEAVER_MAX_REPO_GARBAGE_COLLECTION_JOB_CONCURRENCY",
                DEFAULT_MAX_REPO_GC_JOB_CONCURRENCY,
            ),
            repo_garbage_collection_grace_period_ms: env_parse(
                "REPOWEAVER_REPO_GARBAGE_COLLECTION_GRACE_PERIOD_MS",
                DEFAULT_REPO_GC_GRACE_PERIOD_MS,
            ),
            repo_index_timeout_ms: env_parse(
                "REPOWEAVER_REPO_INDEX_TIMEOUT_MS",
                DEFAULT_REPO_INDEX_TIMEOUT_MS,
            ),
            index_builder_binary: env_string(
                "REPOWEAVER_INDEX_BUILDER_BINARY",
                DEFAULT_INDEX_BUILDER_BINARY,
            ),
            large_org_repo_threshold: env_parse(
                "REPOWEAVER_LARGE_ORG_REPO_THRESHOLD",
                DEFAULT_LARGE_ORG_REPO_THRESHOLD,
            ),
            auth_token: std::env::var("REPOWEAVER_GIT_AUTH_TOKEN").ok(),
        }
    }

    pub const fn reindex_interval(&self) -> Duration {
        Duration::from_millis(self.reindex_interval_ms)
    }

    pub const fn repo_index_timeout(&self) -> Duration {
        Duration::from_millis(self.repo_index_timeout_ms)
    }

    pub const fn garbage_collection_grace_period(&self) -> Duration {
        Duration::from_millis(self.repo_garbage_collection_grace_period_ms)
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_trigram_count: DEFAULT_MAX_TRIGRAM_COUNT,
            reindex_interval_ms: DEFAULT_REINDEX_INTERVAL_MS,
            reindex_repo_polling_interval_ms: DEFAULT_REINDEX_REPO_POLLING_INTERVAL_MS,
            resync_connection_interval_ms: DEFAULT_RESYNC_CONNECTION_INTERVAL_MS,
            resync_connection_polling_interval_ms: DEFAULT_RESYNC_CONNECTION_POLLING_INTERVAL_MS,
            max_repo_indexing_job_concurrency: DEFAULT_MAX_REPO_INDEXING_JOB_CONCURRENCY,
            max_repo_garbage_collection_job_concurrency: DEFAULT_MAX_REPO_GC_JOB_CONCURRENCY,
            repo_garbage_collection_grace_period_ms: DEFAULT_REPO_GC_GRACE_PERIOD_MS,
            repo_index_timeout_ms: DEFAULT_REPO_INDEX_TIMEOUT_MS,
            index_builder_binary: DEFAULT_INDEX_BUILDER_BINARY.to_string(),
            large_org_repo_threshold: DEFAULT_LARGE_ORG_REPO_THRESHOLD,
            auth_token: None,
        }
    }
}

impl validation::Validate for IndexingConfig {
    fn validate(&self) -> ConfigResult<()> {
        validation::validate_range(self.max_file_size, 1, u64::MAX, "max_file_size")?;
        validation::validate_range(self.max_trigram_count, 1, u64::MAX, "max_trigram_count")?;
        validation::validate_range(
            self.reindex_repo_polling_interval_ms,
            10,
            3_600_000,
            "reindex_repo_polling_interval_ms",
        )?;
        validation::validate_range(
            self.resync_connection_polling_interval_ms,
            10,
            3_600_000,
            "resync_connection_polling_interval_ms",
        )?;
        validation::validate_range(
            self.max_repo_indexing_job_concurrency as u64,
            1,
            256,
            "max_repo_indexing_job_concurrency",
        )?;
        validation::validate_range(
            self.max_repo_garbage_collection_job_concurrency as u64,
            1,
            256,
            "max_repo_garbage_collection_job_concurrency",
        )?;
        validation::validate_range(
            self.repo_index_timeout_ms,
            1000,
            u64::MAX,
            "repo_index_timeout_ms",
        )?;
        validation::validate_non_empty(&self.index_builder_binary, "index_builder_binary")?;
        Ok(())
    }
}

/// Filesystem layout
///
/// Working copies live under `<data_cache_dir>/repos/<repo_id>` and index
/// shards under `<data_cache_dir>/index`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PathsConfig {
    pub data_cache_dir: PathBuf,
}

impl PathsConfig {
    /// Load configuration from environment variables with safe defaults
    pub fn from_env() -> Self {
        let data_cache_dir = std::env::var("REPOWEAVER_DATA_CACHE_DIR").map_or_else(
            |_| {
                dirs::cache_dir()
                    .unwrap_or_else(|| PathBuf::from(".cache"))
                    .join("repoweaver")
            },
            PathBuf::from,
        );

        Self { data_cache_dir }
    }

    /// Root for git working copies
    pub fn repos_dir(&self) -> PathBuf {
        self.data_cache_dir.join("repos")
    }

    /// Shared directory the index builder writes shards into
    pub fn index_dir(&self) -> PathBuf {
        self.data_cache_dir.join("index")
    }
}

impl validation::Validate for PathsConfig {
    fn validate(&self) -> ConfigResult<()> {
        validation::validate_non_empty(&self.data_cache_dir.to_string_lossy(), "data_cache_dir")
    }
}

/// Durable job queue configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QueueConfig {
    /// Deliveries per job before it lands in FAILED
    pub max_attempts: u32,

    /// Base delay before a failed attempt is redelivered (doubles per attempt)
    pub backoff_ms: u64,

    /// Stall redeliveries tolerated before the job is failed
    pub max_stalled_count: u32,

    /// A reserved job whose heartbeat is older than this is considered stalled
    pub visibility_timeout_ms: u64,

    /// Idle worker sleep between reservation attempts
    pub poll_interval_ms: u64,

    /// How often stalled reservations are swept
    pub stalled_check_interval_ms: u64,

    /// How long shutdown waits for in-flight jobs to observe cancellation
    pub worker_stop_grace_period_ms: u64,
}

impl QueueConfig {
    /// Load configuration from environment variables with safe defaults
    pub fn from_env() -> Self {
        Self {
            max_attempts: env_parse("REPOWEAVER_QUEUE_MAX_ATTEMPTS", DEFAULT_QUEUE_MAX_ATTEMPTS),
            backoff_ms: env_parse("REPOWEAVER_QUEUE_BACKOFF_MS", DEFAULT_QUEUE_BACKOFF_MS),
            max_stalled_count: env_parse(
                "REPOWEAVER_QUEUE_MAX_STALLED_COUNT",
                DEFAULT_QUEUE_MAX_STALLED_COUNT,
            ),
            visibility_timeout_ms: env_parse(
                "REPOWEAVER_QUEUE_VISIBILITY_TIMEOUT_MS",
                DEFAULT_QUEUE_VISIBILITY_TIMEOUT_MS,
            ),
            poll_interval_ms: env_parse(
                "REPOWEAVER_QUEUE_POLL_INTERVAL_MS",
                DEFAULT_QUEUE_POLL_INTERVAL_MS,
            ),
            stalled_check_interval_ms: env_parse(
                "REPOWEAVER_QUEUE_STALLED_CHECK_INTERVAL_MS",
                DEFAULT_QUEUE_STALLED_CHECK_INTERVAL_MS,
            ),
            worker_stop_grace_period_ms: env_parse(
                "REPOWEAVER_WORKER_STOP_GRACE_PERIOD_MS",
                DEFAULT_WORKER_STOP_GRACE_PERIOD_MS,
            ),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_QUEUE_MAX_ATTEMPTS,
            backoff_ms: DEFAULT_QUEUE_BACKOFF_MS,
            max_stalled_count: DEFAULT_QUEUE_MAX_STALLED_COUNT,
            visibility_timeout_ms: DEFAULT_QUEUE_VISIBILITY_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_QUEUE_POLL_INTERVAL_MS,
            stalled_check_interval_ms: DEFAULT_QUEUE_STALLED_CHECK_INTERVAL_MS,
            worker_stop_grace_period_ms: DEFAULT_WORKER_STOP_GRACE_PERIOD_MS,
        }
    }
}

impl validation::Validate for QueueConfig {
    fn validate(&self) -> ConfigResult<()> {
        validation::validate_range(u64::from(self.max_attempts), 1, 100, "max_attempts")?;
        validation::validate_range(self.backoff_ms, 0, 3_600_000, "backoff_ms")?;
        validation::validate_range(
            self.visibility_timeout_ms,
            1000,
            3_600_000,
            "visibility_timeout_ms",
        )?;
        validation::validate_range(self.poll_interval_ms, 10, 60_000, "poll_interval_ms")?;
        validation::validate_range(
            self.stalled_check_interval_ms,
            100,
            3_600_000,
            "stalled_check_interval_ms",
        )?;
        Ok(())
    }
}

/// Where lease records live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    /// `repo_locks` table in the primary database, plus any quorum databases
    #[default]
    Postgres,
    /// Process-local map; only safe with a single orchestrator process
    Memory,
}

impl FromStr for LockBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::InvalidValue {
                field: "lock.backend".to_string(),
                message: format!("unknown lock backend '{other}'"),
            }),
        }
    }
}

/// Per-repository lease configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LockConfig {
    pub backend: LockBackend,

    /// Lease lifetime; extended in the background while the job runs
    pub ttl_ms: u64,

    /// Fraction of the TTL that must elapse before the lease is extended
    pub extension_threshold: f64,

    /// Delay before a job that lost the race for its repository is redelivered
    pub contention_retry_delay_ms: u64,

    /// Additional independent Postgres databases participating in the quorum
    #[serde(default)]
    pub quorum_urls: Vec<String>,
}

impl LockConfig {
    /// Load configuration from environment variables with safe defaults
    pub fn from_env() -> Self {
        let quorum_urls = std::env::var("REPOWEAVER_LOCK_QUORUM_URLS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            backend: env_parse("REPOWEAVER_LOCK_BACKEND", LockBackend::default()),
            ttl_ms: env_parse("REPOWEAVER_LOCK_TTL_MS", DEFAULT_LOCK_TTL_MS),
            extension_threshold: env_parse(
                "REPOWEAVER_LOCK_EXTENSION_THRESHOLD",
                DEFAULT_LOCK_EXTENSION_THRESHOLD,
            ),
            contention_retry_delay_ms: env_parse(
                "REPOWEAVER_LOCK_CONTENTION_RETRY_DELAY_MS",
                DEFAULT_LOCK_CONTENTION_RETRY_DELAY_MS,
            ),
            quorum_urls,
        }
    }

    pub const fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub const fn contention_retry_delay(&self) -> Duration {
        Duration::from_millis(self.contention_retry_delay_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: LockBackend::default(),
            ttl_ms: DEFAULT_LOCK_TTL_MS,
            extension_threshold: DEFAULT_LOCK_EXTENSION_THRESHOLD,
            contention_retry_delay_ms: DEFAULT_LOCK_CONTENTION_RETRY_DELAY_MS,
            quorum_urls: Vec::new(),
        }
    }
}

impl validation::Validate for LockConfig {
    fn validate(&self) -> ConfigResult<()> {
        validation::validate_range(self.ttl_ms, 1000, 3_600_000, "lock.ttl_ms")?;
        validation::validate_fraction(self.extension_threshold, "lock.extension_threshold")?;
        for url in &self.quorum_urls {
            validation::validate_url(url, &["postgres", "postgresql"], "lock.quorum_urls")?;
        }
        Ok(())
    }
}

/// Database configuration - comprehensive `PostgreSQL` configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DatabaseConfig {
    /// Database host
    pub host: String,

    /// Database port
    pub port: u16,

    /// Database name
    pub database: String,

    /// Username for authentication
    pub username: String,

    /// Password for authentication (use environment variables for security)
    #[serde(default, skip_serializing)]
    pub password: String,

    /// SSL mode for connections ("disable", "prefer", "require")
    pub ssl_mode: String,

    /// Maximum number of connections in pool
    pub max_connections: u32,

    /// Minimum number of connections in pool
    pub min_connections: u32,

    /// Connection timeout in seconds
    pub timeout_seconds: u64,

    /// Idle timeout in seconds
    pub idle_timeout_seconds: u64,

    /// Enable migrations on startup
    pub auto_migrate: bool,
}

impl DatabaseConfig {
    /// Load configuration from environment variables with safe defaults
    pub fn from_env() -> Self {
        let host = std::env::var("REPOWEAVER_DATABASE_HOST")
            .or_else(|_| std::env::var("DB_HOST"))
            .unwrap_or_else(|_| DEFAULT_DB_HOST.to_string());

        let port = std::env::var("REPOWEAVER_DATABASE_PORT")
            .or_else(|_| std::env::var("DB_PORT"))
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_DB_PORT);

        let database = std::env::var("REPOWEAVER_DATABASE_NAME")
            .or_else(|_| std::env::var("DB_NAME"))
            .unwrap_or_else(|_| DEFAULT_DB_NAME.to_string());

        let username = std::env::var("REPOWEAVER_DATABASE_USERNAME")
            .or_else(|_| std::env::var("DB_USER"))
            .unwrap_or_else(|_| DEFAULT_DB_USER.to_string());

        let password = std::env::var("REPOWEAVER_DATABASE_PASSWORD")
            .or_else(|_| std::env::var("DB_PASSWORD"))
            .unwrap_or_else(|_| {
                tracing::warn!(
                    "Using default database password - set REPOWEAVER_DATABASE_PASSWORD or DB_PASSWORD"
                );
                DEFAULT_DB_PASSWORD.to_string()
            });

        let ssl_mode = std::env::var("REPOWEAVER_DATABASE_SSL_MODE")
            .or_else(|_| std::env::var("DB_SSLMODE"))
            .unwrap_or_else(|_| DEFAULT_DB_SSL_MODE.to_string());

        Self {
            host,
            port,
            database,
            username,
            password,
            ssl_mode,
            max_connections: env_parse(
                "REPOWEAVER_DATABASE_MAX_CONNECTIONS",
                DEFAULT_DB_MAX_CONNECTIONS,
            ),
            min_connections: env_parse(
                "REPOWEAVER_DATABASE_MIN_CONNECTIONS",
                DEFAULT_DB_MIN_CONNECTIONS,
            ),
            timeout_seconds: env_parse(
                "REPOWEAVER_DATABASE_TIMEOUT_SECONDS",
                DEFAULT_DB_TIMEOUT_SECONDS,
            ),
            idle_timeout_seconds: env_parse(
                "REPOWEAVER_DATABASE_IDLE_TIMEOUT_SECONDS",
                DEFAULT_DB_IDLE_TIMEOUT_SECONDS,
            ),
            auto_migrate: env_parse("REPOWEAVER_DATABASE_AUTO_MIGRATE", DEFAULT_AUTO_MIGRATE),
        }
    }

    /// Convert string SSL mode to `PgSslMode`
    fn parse_ssl_mode(&self) -> PgSslMode {
        match self.ssl_mode.as_str() {
            "disable" => PgSslMode::Disable,
            "require" => PgSslMode::Require,
            _ => PgSslMode::Prefer,
        }
    }

    /// Build `PostgreSQL` connection options without ever formatting the password into a URL
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.username)
            .password(&self.password)
            .ssl_mode(self.parse_ssl_mode())
    }

    /// Connection info for logging (no password)
    pub fn safe_connection_string(&self) -> String {
        format!(
            "{}@{}:{}/{} (ssl: {})",
            self.username, self.host, self.port, self.database, self.ssl_mode
        )
    }
}

impl validation::Validate for DatabaseConfig {
    fn validate(&self) -> ConfigResult<()> {
        validation::validate_non_empty(&self.host, "database.host")?;
        validation::validate_non_empty(&self.database, "database.database")?;
        validation::validate_port(self.port, "database.port")?;
        validation::validate_range(
            u64::from(self.max_connections),
            1,
            1000,
            "database.max_connections",
        )?;
        validation::validate_range(self.timeout_seconds, 1, 3600, "database.timeout_seconds")?;
        Ok(())
    }
}

/// Telemetry and observability configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TelemetryConfig {
    /// Tracing level (trace, debug, info, warn, error)
    pub tracing_level: String,

    /// Emit one JSON object per log line
    pub json_logs: bool,

    /// Serve Prometheus metrics
    pub enable_metrics: bool,

    /// Metrics exporter port
    pub metrics_port: u16,

    /// Service name for telemetry
    pub service_name: String,
}

impl TelemetryConfig {
    /// Load configuration from environment variables with safe defaults
    pub fn from_env() -> Self {
        Self {
            tracing_level: env_string("REPOWEAVER_TELEMETRY_TRACING_LEVEL", DEFAULT_TRACING_LEVEL),
            json_logs: env_parse("REPOWEAVER_TELEMETRY_JSON_LOGS", DEFAULT_JSON_LOGS),
            enable_metrics: env_parse(
                "REPOWEAVER_TELEMETRY_ENABLE_METRICS",
                DEFAULT_ENABLE_METRICS,
            ),
            metrics_port: env_parse("REPOWEAVER_TELEMETRY_METRICS_PORT", DEFAULT_METRICS_PORT),
            service_name: env_string(
                "REPOWEAVER_TELEMETRY_SERVICE_NAME",
                DEFAULT_TELEMETRY_SERVICE_NAME,
            ),
        }
    }
}

impl validation::Validate for TelemetryConfig {
    fn validate(&self) -> ConfigResult<()> {
        validation::validate_non_empty(&self.service_name, "service_name")?;

        if self.enable_metrics {
            validation::validate_port(self.metrics_port, "metrics_port")?;
        }

        match self.tracing_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            _ => Err(ConfigError::InvalidValue {
                field: "tracing_level".to_string(),
                message: format!("Invalid tracing level: {}", self.tracing_level),
            }),
        }
    }
}

const DEFAULT_ORG_ID: i32 = 1;

const fn default_org_id() -> i32 {
    DEFAULT_ORG_ID
}

/// A configured code host connection
///
/// `config` is passed through to discovery untouched. For `git` connections
/// it holds `{"url": "file:///srv/git/**/repo"}` plus optional
/// `{"revisions": {"branches": [..], "tags": [..]}}`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_org_id")]
    pub org_id: i32,
    pub name: String,
    #[serde(rename = "type")]
    pub connection_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ConnectionConfig {
    /// Connections from `REPOWEAVER_CONNECTIONS`, a JSON array
    ///
    /// Unset or malformed values yield no connections; a malformed value is logged.
    pub fn from_env() -> Vec<Self> {
        let Ok(raw) = std::env::var("REPOWEAVER_CONNECTIONS") else {
            return Vec::new();
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Ignoring malformed REPOWEAVER_CONNECTIONS");
            Vec::new()
        })
    }
}

impl validation::Validate for ConnectionConfig {
    fn validate(&self) -> ConfigResult<()> {
        validation::validate_non_empty(&self.name, "connections.name")?;
        validation::validate_non_empty(&self.connection_type, "connections.type")?;
        if self.connection_type == "git" {
            let url = self
                .config
                .get("url")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            validation::validate_url(url, &["file"], "connections.config.url")?;
        }
        Ok(())
    }
}

impl ApplicationConfig {
    /// Load configuration from environment variables with safe defaults
    pub fn from_env() -> Self {
        Self {
            indexing: IndexingConfig::from_env(),
            paths: PathsConfig::from_env(),
            queue: QueueConfig::from_env(),
            lock: LockConfig::from_env(),
            database: DatabaseConfig::from_env(),
            telemetry: TelemetryConfig::from_env(),
            connections: ConnectionConfig::from_env(),
        }
    }
}

impl validation::Validate for ApplicationConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.indexing.validate()?;
        self.paths.validate()?;
        self.queue.validate()?;
        self.lock.validate()?;
        self.database.validate()?;
        self.telemetry.validate()?;
        for connection in &self.connections {
            connection.validate()?;
        }

        let mut seen = std::collections::HashSet::new();
        for connection in &self.connections {
            if !seen.insert((connection.org_id, connection.name.as_str())) {
                return Err(ConfigError::InvalidValue {
                    field: "connections".to_string(),
                    message: format!(
                        "duplicate connection '{}' in org {}",
                        connection.name, connection.org_id
                    ),
                });
            }
        }

        // A lease that outlives the job timeout would keep a timed-out
        // repository locked after its job was already failed.
        if self.lock.ttl_ms >= self.indexing.repo_index_timeout_ms {
            return Err(ConfigError::InvalidValue {
                field: "lock.ttl_ms".to_string(),
                message: format!(
                    "{} must be smaller than indexing.repo_index_timeout_ms ({})",
                    self.lock.ttl_ms, self.indexing.repo_index_timeout_ms
                ),
            });
        }

        Ok(())
    }
}
