use std::str::FromStr;
use std::time::Duration;

use super::{AppConfig, ConfigError};
use crate::models::submission::MAX_RETRY_CEILING;
use crate::services::retry::RetryPolicy;

/// Engine settings that may be overridden through the persisted `config` table.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum ConfigKey {
    PollIntervalMs,
    JobTimeoutSecs,
    BackoffBase,
    BackoffMaxJitterSecs,
    MaxRetries,
    LeaseGraceSecs,
    StaleFailedAfterSecs,
}

impl ConfigKey {
    pub fn parse(key: &str) -> Result<Self, ConfigError> {
        Self::from_str(key).map_err(|_| ConfigError::UnknownKey(key.to_string()))
    }
}

/// Resolved tuning knobs for the worker loop, retry policy and sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub backoff_base: f64,
    pub backoff_max_jitter: f64,
    pub default_max_retries: u32,
    pub lease_grace: Duration,
    pub stale_failed_after: Duration,
    pub sweep_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl EngineSettings {
    /// Settings straight from process configuration, without stored overrides.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            job_timeout: Duration::from_secs(config.job_timeout_secs),
            backoff_base: config.backoff_base,
            backoff_max_jitter: config.backoff_max_jitter_secs,
            default_max_retries: config.default_max_retries,
            lease_grace: Duration::from_secs(config.lease_grace_secs),
            stale_failed_after: Duration::from_secs(config.stale_failed_after_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
        }
    }

    /// Overlay stored `config` rows. Unknown keys and bad values are skipped.
    pub fn with_overrides<I, K, V>(mut self, rows: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in rows {
            let result = ConfigKey::parse(key.as_ref())
                .and_then(|key| self.apply(key, value.as_ref()));
            if let Err(e) = result {
                tracing::warn!(error = %e, "Ignoring stored config override");
            }
        }
        self
    }

    /// Parse and validate `raw`, then store it under `key`.
    pub fn apply(&mut self, key: ConfigKey, raw: &str) -> Result<(), ConfigError> {
        let raw = raw.trim();
        match key {
            ConfigKey::PollIntervalMs => {
                let ms: u64 = parse_in_range(key, raw, 1, 3_600_000)?;
                self.poll_interval = Duration::from_millis(ms);
            }
            ConfigKey::JobTimeoutSecs => {
                let secs: u64 = parse_in_range(key, raw, 1, 86_400)?;
                self.job_timeout = Duration::from_secs(secs);
            }
            ConfigKey::BackoffBase => {
                self.backoff_base = parse_float_in_range(key, raw, 1.0, 10.0)?;
            }
            ConfigKey::BackoffMaxJitterSecs => {
                self.backoff_max_jitter = parse_float_in_range(key, raw, 0.0, 3600.0)?;
            }
            ConfigKey::MaxRetries => {
                self.default_max_retries = parse_in_range(key, raw, 0, MAX_RETRY_CEILING)?;
            }
            ConfigKey::LeaseGraceSecs => {
                let secs: u64 = parse_in_range(key, raw, 0, 86_400)?;
                self.lease_grace = Duration::from_secs(secs);
            }
            ConfigKey::StaleFailedAfterSecs => {
                let secs: u64 = parse_in_range(key, raw, 1, 7 * 86_400)?;
                self.stale_failed_after = Duration::from_secs(secs);
            }
        }
        Ok(())
    }

    /// Current value of `key`, rendered the way `apply` accepts it.
    pub fn value_of(&self, key: ConfigKey) -> String {
        match key {
            ConfigKey::PollIntervalMs => self.poll_interval.as_millis().to_string(),
            ConfigKey::JobTimeoutSecs => self.job_timeout.as_secs().to_string(),
            ConfigKey::BackoffBase => self.backoff_base.to_string(),
            ConfigKey::BackoffMaxJitterSecs => self.backoff_max_jitter.to_string(),
            ConfigKey::MaxRetries => self.default_max_retries.to_string(),
            ConfigKey::LeaseGraceSecs => self.lease_grace.as_secs().to_string(),
            ConfigKey::StaleFailedAfterSecs => self.stale_failed_after.as_secs().to_string(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.backoff_base, self.backoff_max_jitter)
    }

    /// How long a `processing` job may go without an outcome before the sweep reclaims it.
    pub fn lease_timeout(&self) -> Duration {
        self.job_timeout + self.lease_grace
    }
}

/// Validate a raw value for `key` without keeping it.
pub fn validate_value(key: ConfigKey, raw: &str) -> Result<(), ConfigError> {
    EngineSettings::default().apply(key, raw)
}

fn invalid(key: ConfigKey, raw: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
        reason: reason.into(),
    }
}

fn parse_in_range<T>(key: ConfigKey, raw: &str, min: T, max: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + std::fmt::Display,
{
    let value: T = raw
        .parse()
        .map_err(|_| invalid(key, raw, "expected a non-negative integer"))?;
    if value < min || value > max {
        return Err(invalid(key, raw, format!("must be between {min} and {max}")));
    }
    Ok(value)
}

fn parse_float_in_range(key: ConfigKey, raw: &str, min: f64, max: f64) -> Result<f64, ConfigError> {
    let value: f64 = raw
        .parse()
        .map_err(|_| invalid(key, raw, "expected a number"))?;
    if !value.is_finite() || value < min || value > max {
        return Err(invalid(key, raw, format!("must be between {min} and {max}")));
    }
    Ok(value)
}
