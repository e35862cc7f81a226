//! Logging and metrics shared by every taskrelay crate.

/// Install the JSON tracing subscriber. Later calls are no-ops.
pub fn init() {
    tracing::init();
}

pub mod metrics;
pub mod tracing;

pub use metrics::{Counter, Gauge, InMemoryMetrics, MetricsSink, NoopMetrics, Outcome, TracingMetrics};
pub use tracing::LogFormat;
