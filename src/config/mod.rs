use serde::Deserialize;

pub mod settings;

pub use settings::{ConfigKey, EngineSettings};

/// Environment prefix for every process-level setting.
pub const ENV_PREFIX: &str = "QUEUECTL_";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// SQLite connection string (e.g., "sqlite://queuectl.db")
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// HTTP API bind address (e.g., "0.0.0.0:3000"). Only used by `serve`.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Number of worker loops the standalone worker daemon runs
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Idle poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Wall-clock budget for a single command run
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Exponential backoff base
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,

    /// Upper bound of the uniform jitter added to each backoff delay
    #[serde(default = "default_backoff_max_jitter_secs")]
    pub backoff_max_jitter_secs: f64,

    /// Retry ceiling applied to submissions that do not carry their own
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Extra time past the job timeout before a `processing` job counts as abandoned
    #[serde(default = "default_lease_grace_secs")]
    pub lease_grace_secs: u64,

    /// Age after which a `failed` job that was never requeued gets reconciled
    #[serde(default = "default_stale_failed_after_secs")]
    pub stale_failed_after_secs: u64,

    /// How often each worker pool runs the lease-expiry sweep
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_database_url() -> String {
    "sqlite://queuectl.db".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_worker_count() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_job_timeout_secs() -> u64 {
    300
}

fn default_backoff_base() -> f64 {
    2.0
}

fn default_backoff_max_jitter_secs() -> f64 {
    1.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_lease_grace_secs() -> u64 {
    60
}

fn default_stale_failed_after_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            bind_addr: default_bind_addr(),
            worker_count: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            job_timeout_secs: default_job_timeout_secs(),
            backoff_base: default_backoff_base(),
            backoff_max_jitter_secs: default_backoff_max_jitter_secs(),
            default_max_retries: default_max_retries(),
            lease_grace_secs: default_lease_grace_secs(),
            stale_failed_after_secs: default_stale_failed_after_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        envy::prefixed(ENV_PREFIX)
            .from_env()
            .map_err(ConfigError::Env)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Unknown config key '{0}'")]
    UnknownKey(String),

    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: ConfigKey,
        value: String,
        reason: String,
    },
}
