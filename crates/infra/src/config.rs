//! Store client configuration.
//!
//! Configuration is an immutable value built once at startup (defaults,
//! builders, or [`ClientConfig::from_env`]) and passed into
//! [`ResilientStoreClient::connect`](crate::client::ResilientStoreClient::connect).
//! Durations are (de)serialized as integer milliseconds.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use taskrelay_core::{DomainError, DomainResult};

use crate::retry::BackoffPolicy;

/// Connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Connection URL (e.g. `redis://127.0.0.1:6379/0`)
    pub url: String,
    /// Overrides any password embedded in the URL
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Upper bound for a single store round trip
    #[serde(with = "duration_ms")]
    pub operation_timeout: Duration,
    /// Upper bound for establishing a connection
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            password: None,
            operation_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Retry policy for transport-level failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per operation, including the first
    pub max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Relative jitter; the delay moves by at most ±factor/2
    pub jitter_factor: f64,
    /// Log every retry at warning level
    pub log_retry_attempts: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            jitter_factor: 0.1,
            log_retry_attempts: true,
        }
    }
}

impl RetryConfig {
    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            backoff_factor: self.backoff_factor,
            jitter_factor: self.jitter_factor,
        }
    }
}

/// Background health checking and reconnection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    #[serde(with = "duration_ms")]
    pub check_interval: Duration,
    /// Reconnect attempts per recovery episode
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
    #[serde(with = "duration_ms")]
    pub max_backoff_delay: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(30),
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_backoff_delay: Duration::from_secs(5 * 60),
        }
    }
}

impl RecoveryConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff_delay = max;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: self.initial_backoff,
            max_delay: self.max_backoff_delay,
            backoff_factor: self.backoff_factor,
            jitter_factor: 0.0,
        }
    }
}

/// Everything the resilient client needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub store: StoreConfig,
    pub retry: RetryConfig,
    pub recovery: RecoveryConfig,
}

impl ClientConfig {
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }

    /// Check value ranges that would make the client misbehave.
    pub fn validate(&self) -> DomainResult<()> {
        if self.retry.max_attempts == 0 {
            return Err(DomainError::validation("retry.max_attempts must be at least 1"));
        }
        if !(self.retry.backoff_factor > 0.0) {
            return Err(DomainError::validation("retry.backoff_factor must be positive"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(DomainError::validation("retry.jitter_factor must be within 0.0..=1.0"));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(DomainError::validation("retry.initial_delay must not exceed retry.max_delay"));
        }
        if self.store.operation_timeout.is_zero() {
            return Err(DomainError::validation("store.operation_timeout must be greater than zero"));
        }
        if self.recovery.enabled && self.recovery.check_interval.is_zero() {
            return Err(DomainError::validation("recovery.check_interval must be greater than zero"));
        }
        Ok(())
    }

    /// Defaults overridden by `TASKRELAY_*` environment variables.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `TASKRELAY_REDIS_URL` | `store.url` |
    /// | `TASKRELAY_REDIS_PASSWORD` | `store.password` |
    /// | `TASKRELAY_REDIS_OPERATION_TIMEOUT_MS` | `store.operation_timeout` |
    /// | `TASKRELAY_REDIS_CONNECT_TIMEOUT_MS` | `store.connect_timeout` |
    /// | `TASKRELAY_RETRY_MAX_ATTEMPTS` | `retry.max_attempts` |
    /// | `TASKRELAY_RETRY_INITIAL_DELAY_MS` | `retry.initial_delay` |
    /// | `TASKRELAY_RETRY_MAX_DELAY_MS` | `retry.max_delay` |
    /// | `TASKRELAY_RETRY_BACKOFF_FACTOR` | `retry.backoff_factor` |
    /// | `TASKRELAY_RETRY_JITTER_FACTOR` | `retry.jitter_factor` |
    /// | `TASKRELAY_RECOVERY_ENABLED` | `recovery.enabled` |
    /// | `TASKRELAY_RECOVERY_CHECK_INTERVAL_MS` | `recovery.check_interval` |
    /// | `TASKRELAY_RECOVERY_MAX_RETRIES` | `recovery.max_retries` |
    /// | `TASKRELAY_RECOVERY_MAX_BACKOFF_MS` | `recovery.max_backoff_delay` |
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(url) = env_value::<String>("TASKRELAY_REDIS_URL")? {
            config.store.url = url;
        }
        if let Some(password) = env_value::<String>("TASKRELAY_REDIS_PASSWORD")? {
            config.store.password = Some(password).filter(|p| !p.is_empty());
        }
        if let Some(d) = env_millis("TASKRELAY_REDIS_OPERATION_TIMEOUT_MS")? {
            config.store.operation_timeout = d;
        }
        if let Some(d) = env_millis("TASKRELAY_REDIS_CONNECT_TIMEOUT_MS")? {
            config.store.connect_timeout = d;
        }

        if let Some(n) = env_value("TASKRELAY_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = n;
        }
        if let Some(d) = env_millis("TASKRELAY_RETRY_INITIAL_DELAY_MS")? {
            config.retry.initial_delay = d;
        }
        if let Some(d) = env_millis("TASKRELAY_RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay = d;
        }
        if let Some(f) = env_value("TASKRELAY_RETRY_BACKOFF_FACTOR")? {
            config.retry.backoff_factor = f;
        }
        if let Some(f) = env_value("TASKRELAY_RETRY_JITTER_FACTOR")? {
            config.retry.jitter_factor = f;
        }

        if let Some(enabled) = env_value("TASKRELAY_RECOVERY_ENABLED")? {
            config.recovery.enabled = enabled;
        }
        if let Some(d) = env_millis("TASKRELAY_RECOVERY_CHECK_INTERVAL_MS")? {
            config.recovery.check_interval = d;
        }
        if let Some(n) = env_value("TASKRELAY_RECOVERY_MAX_RETRIES")? {
            config.recovery.max_retries = n;
        }
        if let Some(d) = env_millis("TASKRELAY_RECOVERY_MAX_BACKOFF_MS")? {
            config.recovery.max_backoff_delay = d;
        }

        config
            .validate()
            .context("invalid client configuration")?;
        Ok(config)
    }
}

/// Read and parse an environment variable; unset or blank yields `None`.
pub fn env_value<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("failed to parse environment variable {}", name)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read environment variable {}", name)),
    }
}

/// Read an integer millisecond value from the environment.
pub fn env_millis(name: &str) -> anyhow::Result<Option<Duration>> {
    Ok(env_value::<u64>(name)?.map(Duration::from_millis))
}

/// Serde adapter: `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
