//! Per-operation call statistics.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::duration_ms;

/// Counters for one operation name (e.g. `xadd`, `hget`).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationMetrics {
    pub total_calls: u64,
    pub success_count: u64,
    pub error_count: u64,
    /// Retries performed, not counting first attempts
    pub retry_count: u64,
    /// Sum of end-to-end latencies, retries and backoff included
    #[serde(with = "duration_ms")]
    pub total_latency: Duration,
    pub last_error: Option<String>,
    pub last_called_at: Option<DateTime<Utc>>,
}

impl OperationMetrics {
    pub fn average_latency(&self) -> Duration {
        match u32::try_from(self.total_calls) {
            Ok(0) => Duration::ZERO,
            Ok(calls) => self.total_latency / calls,
            Err(_) => Duration::ZERO,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 1.0;
        }
        self.success_count as f64 / self.total_calls as f64
    }
}

#[derive(Debug, Default)]
pub(crate) struct MetricsTable {
    operations: HashMap<String, OperationMetrics>,
}

impl MetricsTable {
    pub(crate) fn record(&mut self, operation: &str, latency: Duration, retries: u32, error: Option<String>) {
        let entry = self.operations.entry(operation.to_string()).or_default();
        entry.total_calls += 1;
        entry.retry_count += u64::from(retries);
        entry.total_latency += latency;
        entry.last_called_at = Some(Utc::now());
        match error {
            Some(error) => {
                entry.error_count += 1;
                entry.last_error = Some(error);
            }
            None => entry.success_count += 1,
        }
    }

    pub(crate) fn snapshot(&self) -> HashMap<String, OperationMetrics> {
        self.operations.clone()
    }

    pub(crate) fn reset(&mut self) {
        self.operations.clear();
    }
}
