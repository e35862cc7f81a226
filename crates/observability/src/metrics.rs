//! Metrics sink abstraction.
//!
//! Components report counters (appended/read/acknowledged/retried/failed
//! operations) and gauges (stream lengths, pending entries) through
//! [`MetricsSink`]. Exporter wiring is left to the embedding process; this
//! module ships a no-op sink, an in-memory sink (tests, health endpoints) and a
//! sink that emits `tracing` events.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

/// Monotonic counters.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    TasksAppended,
    TasksRead,
    TasksAcknowledged,
    TasksRetried,
    TasksFailed,
    TasksCompleted,
    /// Task index store/lookup/remove
    IndexOperations,
    /// Timeout set add/query/remove
    TimeoutOperations,
}

impl Counter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Counter::TasksAppended => "tasks_appended",
            Counter::TasksRead => "tasks_read",
            Counter::TasksAcknowledged => "tasks_acknowledged",
            Counter::TasksRetried => "tasks_retried",
            Counter::TasksFailed => "tasks_failed",
            Counter::TasksCompleted => "tasks_completed",
            Counter::IndexOperations => "index_operations",
            Counter::TimeoutOperations => "timeout_operations",
        }
    }
}

/// Point-in-time values.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Gauge {
    StreamLength,
    PendingEntries,
    TrackedTimeouts,
}

impl Gauge {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gauge::StreamLength => "stream_length",
            Gauge::PendingEntries => "pending_entries",
            Gauge::TrackedTimeouts => "tracked_timeouts",
        }
    }
}

/// Outcome tag attached to every counter increment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    /// Operation succeeded but found nothing (e.g. empty read, index miss)
    Empty,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Empty => "empty",
        }
    }

    pub fn from_result<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

/// Receives counters and gauges.
///
/// `label` is the stream name or operation name the value refers to.
/// Implementations must be cheap and must never fail the caller.
pub trait MetricsSink: Send + Sync + fmt::Debug {
    fn increment(&self, counter: Counter, label: &str, outcome: Outcome);

    fn gauge(&self, gauge: Gauge, label: &str, value: f64);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _counter: Counter, _label: &str, _outcome: Outcome) {}

    fn gauge(&self, _gauge: Gauge, _label: &str, _value: f64) {}
}

/// Emits one `debug!` event per observation under `taskrelay::metrics`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment(&self, counter: Counter, label: &str, outcome: Outcome) {
        ::tracing::debug!(
            target: "taskrelay::metrics",
            counter = counter.as_str(),
            label,
            outcome = outcome.as_str(),
            "counter incremented"
        );
    }

    fn gauge(&self, gauge: Gauge, label: &str, value: f64) {
        ::tracing::debug!(
            target: "taskrelay::metrics",
            gauge = gauge.as_str(),
            label,
            value,
            "gauge updated"
        );
    }
}

#[derive(Debug, Default)]
struct Recorded {
    counters: HashMap<(Counter, String, Outcome), u64>,
    gauges: HashMap<(Gauge, String), f64>,
}

/// A single counter series in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CounterSample {
    pub counter: Counter,
    pub label: String,
    pub outcome: Outcome,
    pub value: u64,
}

/// A single gauge series in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GaugeSample {
    pub gauge: Gauge,
    pub label: String,
    pub value: f64,
}

/// Serializable copy of everything an [`InMemoryMetrics`] has recorded.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub counters: Vec<CounterSample>,
    pub gauges: Vec<GaugeSample>,
}

/// Keeps counters and last gauge values in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    inner: Mutex<Recorded>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of one counter series.
    pub fn counter(&self, counter: Counter, label: &str, outcome: Outcome) -> u64 {
        self.lock()
            .counters
            .get(&(counter, label.to_string(), outcome))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of a counter across labels and outcomes.
    pub fn total(&self, counter: Counter) -> u64 {
        self.lock()
            .counters
            .iter()
            .filter(|((c, _, _), _)| *c == counter)
            .map(|(_, v)| *v)
            .sum()
    }

    pub fn gauge_value(&self, gauge: Gauge, label: &str) -> Option<f64> {
        self.lock().gauges.get(&(gauge, label.to_string())).copied()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let recorded = self.lock();
        let mut counters: Vec<CounterSample> = recorded
            .counters
            .iter()
            .map(|((counter, label, outcome), value)| CounterSample {
                counter: *counter,
                label: label.clone(),
                outcome: *outcome,
                value: *value,
            })
            .collect();
        counters.sort_by(|a, b| {
            (a.counter.as_str(), &a.label, a.outcome.as_str())
                .cmp(&(b.counter.as_str(), &b.label, b.outcome.as_str()))
        });

        let mut gauges: Vec<GaugeSample> = recorded
            .gauges
            .iter()
            .map(|((gauge, label), value)| GaugeSample {
                gauge: *gauge,
                label: label.clone(),
                value: *value,
            })
            .collect();
        gauges.sort_by(|a, b| (a.gauge.as_str(), &a.label).cmp(&(b.gauge.as_str(), &b.label)));

        MetricsSnapshot { counters, gauges }
    }

    pub fn reset(&self) {
        let mut recorded = self.lock();
        recorded.counters.clear();
        recorded.gauges.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, counter: Counter, label: &str, outcome: Outcome) {
        *self
            .lock()
            .counters
            .entry((counter, label.to_string(), outcome))
            .or_insert(0) += 1;
    }

    fn gauge(&self, gauge: Gauge, label: &str, value: f64) {
        self.lock().gauges.insert((gauge, label.to_string()), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_sink_counts_per_series() {
        let metrics = InMemoryMetrics::new();
        metrics.increment(Counter::TasksAppended, "dispatched", Outcome::Success);
        metrics.increment(Counter::TasksAppended, "dispatched", Outcome::Success);
        metrics.increment(Counter::TasksAppended, "dispatched", Outcome::Failure);
        metrics.increment(Counter::TasksRead, "retry", Outcome::Empty);

        assert_eq!(metrics.counter(Counter::TasksAppended, "dispatched", Outcome::Success), 2);
        assert_eq!(metrics.total(Counter::TasksAppended), 3);
        assert_eq!(metrics.counter(Counter::TasksRead, "retry", Outcome::Success), 0);

        metrics.gauge(Gauge::StreamLength, "dispatched", 4.0);
        metrics.gauge(Gauge::StreamLength, "dispatched", 5.0);
        assert_eq!(metrics.gauge_value(Gauge::StreamLength, "dispatched"), Some(5.0));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.counters.len(), 3);
        assert_eq!(snapshot.gauges.len(), 1);

        metrics.reset();
        assert_eq!(metrics.total(Counter::TasksAppended), 0);
    }

    #[test]
    fn outcome_follows_result() {
        let ok: Result<(), ()> = Ok(());
        let err: Result<(), ()> = Err(());
        assert_eq!(Outcome::from_result(&ok), Outcome::Success);
        assert_eq!(Outcome::from_result(&err), Outcome::Failure);
    }
}
