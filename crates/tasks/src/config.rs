//! Lifecycle manager configuration.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use taskrelay_core::LifecycleStream;
use taskrelay_infra::BackoffPolicy;
use taskrelay_infra::config::{duration_ms, env_millis, env_value};

/// Smallest and largest accepted fallback scan window.
pub const SCAN_LIMIT_RANGE: (usize, usize) = (100, 1000);

/// Stream, index and worker settings. Immutable once the manager is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    #[serde(with = "duration_ms")]
    pub dispatched_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub completed_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub failed_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub retry_ttl: Duration,
    /// TTL of the task index hash; must outlive every stream
    #[serde(with = "duration_ms")]
    pub index_ttl: Duration,
    /// TTL of the timeout sorted set
    #[serde(with = "duration_ms")]
    pub timeout_set_ttl: Duration,
    /// Approximate per-stream cap (`MAXLEN ~`)
    pub max_stream_length: usize,
    /// Newest dispatched entries scanned when the index misses
    pub fallback_scan_limit: usize,

    /// Failure transitions allowed before a task is failed for good
    pub max_retry_attempts: u32,
    #[serde(with = "duration_ms")]
    pub retry_initial_delay: Duration,
    #[serde(with = "duration_ms")]
    pub retry_max_delay: Duration,
    pub retry_backoff_factor: f64,

    /// Consumer name used by this process's workers
    pub consumer_name: String,
    pub read_count: usize,
    /// Block time of group reads; bounds how long a reader ignores cancellation
    #[serde(with = "duration_ms")]
    pub read_block: Duration,

    #[serde(with = "duration_ms")]
    pub timeout_check_interval: Duration,
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,
    #[serde(with = "duration_ms")]
    pub pending_cleanup_interval: Duration,
    /// Pending entries idle longer than this are acknowledged by cleanup
    #[serde(with = "duration_ms")]
    pub pending_idle_threshold: Duration,
    #[serde(with = "duration_ms")]
    pub retry_poll_interval: Duration,
    /// Retry entries another consumer left pending this long are taken over
    #[serde(with = "duration_ms")]
    pub retry_claim_idle: Duration,
    #[serde(with = "duration_ms")]
    pub confirmation_poll_interval: Duration,
    pub length_warning_threshold: u64,
    pub pending_warning_threshold: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            dispatched_ttl: Duration::from_secs(3600),
            completed_ttl: Duration::from_secs(3600),
            failed_ttl: Duration::from_secs(3600),
            retry_ttl: Duration::from_secs(3600),
            index_ttl: Duration::from_secs(2 * 3600),
            timeout_set_ttl: Duration::from_secs(2 * 3600),
            max_stream_length: 10_000,
            fallback_scan_limit: 500,
            max_retry_attempts: 3,
            retry_initial_delay: Duration::from_secs(5),
            retry_max_delay: Duration::from_secs(5 * 60),
            retry_backoff_factor: 2.0,
            consumer_name: "taskrelay-worker".to_string(),
            read_count: 10,
            read_block: Duration::from_secs(1),
            timeout_check_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            pending_cleanup_interval: Duration::from_secs(5 * 60),
            pending_idle_threshold: Duration::from_secs(3600),
            retry_poll_interval: Duration::from_secs(5),
            retry_claim_idle: Duration::from_secs(30),
            confirmation_poll_interval: Duration::from_secs(1),
            length_warning_threshold: 50,
            pending_warning_threshold: 100,
        }
    }
}

impl LifecycleConfig {
    /// Retention of `stream`.
    pub fn ttl_for(&self, stream: LifecycleStream) -> Duration {
        match stream {
            LifecycleStream::Dispatched => self.dispatched_ttl,
            LifecycleStream::Completed => self.completed_ttl,
            LifecycleStream::Failed => self.failed_ttl,
            LifecycleStream::Retry => self.retry_ttl,
        }
    }

    /// Fallback scan window, clamped to [`SCAN_LIMIT_RANGE`].
    pub fn scan_limit(&self) -> usize {
        self.fallback_scan_limit
            .clamp(SCAN_LIMIT_RANGE.0, SCAN_LIMIT_RANGE.1)
    }

    /// Delay schedule for staged retries (jittered).
    pub fn retry_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::exponential(
            self.retry_initial_delay,
            self.retry_max_delay,
            self.retry_backoff_factor,
        )
        .with_jitter(0.1)
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    pub fn with_stream_ttl(mut self, ttl: Duration) -> Self {
        self.dispatched_ttl = ttl;
        self.completed_ttl = ttl;
        self.failed_ttl = ttl;
        self.retry_ttl = ttl;
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    pub fn with_retry_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial_delay = initial;
        self.retry_max_delay = max;
        self
    }

    pub fn with_fallback_scan_limit(mut self, limit: usize) -> Self {
        self.fallback_scan_limit = limit;
        self
    }

    pub fn with_worker_intervals(
        mut self,
        timeout_check: Duration,
        health_check: Duration,
        retry_poll: Duration,
    ) -> Self {
        self.timeout_check_interval = timeout_check;
        self.health_check_interval = health_check;
        self.retry_poll_interval = retry_poll;
        self
    }

    pub fn with_retry_claim_idle(mut self, idle: Duration) -> Self {
        self.retry_claim_idle = idle;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        let longest_stream = LifecycleStream::ALL
            .into_iter()
            .map(|s| self.ttl_for(s))
            .max()
            .unwrap_or_default();

        if LifecycleStream::ALL.into_iter().any(|s| self.ttl_for(s).is_zero()) {
            return Err("stream TTLs must be greater than zero".into());
        }
        if self.index_ttl <= longest_stream {
            return Err(format!(
                "index_ttl ({:?}) must exceed every stream TTL ({:?})",
                self.index_ttl, longest_stream
            ));
        }
        if self.max_stream_length == 0 {
            return Err("max_stream_length must be greater than zero".into());
        }
        if self.consumer_name.trim().is_empty() {
            return Err("consumer_name must not be empty".into());
        }
        if self.read_count == 0 {
            return Err("read_count must be greater than zero".into());
        }
        if !(self.retry_backoff_factor >= 1.0) {
            return Err("retry_backoff_factor must be at least 1.0".into());
        }
        let intervals = [
            self.timeout_check_interval,
            self.health_check_interval,
            self.pending_cleanup_interval,
            self.retry_poll_interval,
            self.confirmation_poll_interval,
        ];
        if intervals.iter().any(Duration::is_zero) {
            return Err("worker intervals must be greater than zero".into());
        }
        if self.retry_claim_idle <= self.retry_poll_interval {
            return Err(format!(
                "retry_claim_idle ({:?}) must exceed retry_poll_interval ({:?})",
                self.retry_claim_idle, self.retry_poll_interval
            ));
        }
        Ok(())
    }

    /// Defaults overridden by `TASKRELAY_*` environment variables.
    ///
    /// Durations are integer milliseconds: `TASKRELAY_STREAM_TTL_MS`,
    /// `TASKRELAY_INDEX_TTL_MS`, `TASKRELAY_TIMEOUT_SET_TTL_MS`,
    /// `TASKRELAY_TIMEOUT_CHECK_INTERVAL_MS`, `TASKRELAY_HEALTH_CHECK_INTERVAL_MS`,
    /// `TASKRELAY_RETRY_POLL_INTERVAL_MS`, `TASKRELAY_RETRY_CLAIM_IDLE_MS`. Counts: `TASKRELAY_MAX_STREAM_LENGTH`,
    /// `TASKRELAY_FALLBACK_SCAN_LIMIT`, `TASKRELAY_MAX_RETRY_ATTEMPTS`.
    /// `TASKRELAY_CONSUMER_NAME` names this process's consumer.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(ttl) = env_millis("TASKRELAY_STREAM_TTL_MS")? {
            config = config.with_stream_ttl(ttl);
        }
        if let Some(ttl) = env_millis("TASKRELAY_INDEX_TTL_MS")? {
            config.index_ttl = ttl;
        }
        if let Some(ttl) = env_millis("TASKRELAY_TIMEOUT_SET_TTL_MS")? {
            config.timeout_set_ttl = ttl;
        }
        if let Some(d) = env_millis("TASKRELAY_TIMEOUT_CHECK_INTERVAL_MS")? {
            config.timeout_check_interval = d;
        }
        if let Some(d) = env_millis("TASKRELAY_HEALTH_CHECK_INTERVAL_MS")? {
            config.health_check_interval = d;
        }
        if let Some(d) = env_millis("TASKRELAY_RETRY_POLL_INTERVAL_MS")? {
            config.retry_poll_interval = d;
        }
        if let Some(d) = env_millis("TASKRELAY_RETRY_CLAIM_IDLE_MS")? {
            config.retry_claim_idle = d;
        }
        if let Some(n) = env_value("TASKRELAY_MAX_STREAM_LENGTH")? {
            config.max_stream_length = n;
        }
        if let Some(n) = env_value("TASKRELAY_FALLBACK_SCAN_LIMIT")? {
            config.fallback_scan_limit = n;
        }
        if let Some(n) = env_value("TASKRELAY_MAX_RETRY_ATTEMPTS")? {
            config.max_retry_attempts = n;
        }
        if let Some(name) = env_value::<String>("TASKRELAY_CONSUMER_NAME")? {
            config.consumer_name = name;
        }

        config
            .validate()
            .map_err(anyhow::Error::msg)
            .context("invalid lifecycle configuration")?;
        Ok(config)
    }
}
