//! Infrastructure layer: store backends, the resilient client, locks, retry
//! and configuration.

pub mod client;
pub mod config;
pub mod lock;
pub mod retry;
pub mod store;

pub use client::{ConnectionStatus, HealthCheckResult, MonitoringHooks, OperationMetrics, ResilientStoreClient};
pub use config::{ClientConfig, RecoveryConfig, RetryConfig, StoreConfig};
pub use lock::{DistributedLock, RetryStrategy};
pub use retry::{BackoffPolicy, RetryError, RetryExecutor};
pub use store::{InMemoryBackend, StoreBackend, StoreError, StoreResult};
