//! Task lifecycle orchestration.
//!
//! [`TaskLifecycleManager`] moves tasks through four durable streams:
//!
//! ```text
//! enqueue ──► dispatched ──► completed
//!                 │    ╲
//!                 │     ╲──► failed
//!                 ▼
//!               retry ──(due)──► dispatched (new lifecycle)
//! ```
//!
//! Supporting pieces:
//! - [`TaskIndex`]: task id → current stream entry, O(1)
//! - [`ExpirationTracker`]: confirmation deadlines in a sorted set
//! - [`workers`]: timeout scanner, stream health monitor, retry re-dispatcher
//!   and confirmation pump, all cancellable
//! - [`DeliverySink`]: hands dispatched tasks to performers

pub mod config;
pub mod confirmations;
pub mod delivery;
pub mod error;
pub mod expiration;
pub mod index;
pub mod manager;
pub mod workers;

pub use config::LifecycleConfig;
pub use confirmations::{ConfirmationPump, PumpReport};
pub use delivery::{DeliveryError, DeliverySink, RecordingDelivery};
pub use error::{LifecycleError, LifecycleResult};
pub use expiration::{ExpirationTracker, TimeoutStats};
pub use index::{IndexEntry, TaskIndex};
pub use manager::{
    DispatchOutcome, LocatedTask, PendingGroupInfo, RetryStaging, StreamHealthReport, StreamInfo,
    StreamStats, TASK_FINDER_GROUP, TASK_PROCESSORS_GROUP, TIMEOUT_CHECKER_GROUP, TIMEOUT_REASON,
    TaskLifecycleManager, TimeoutSweep, TransitionOutcome,
};
pub use workers::WorkerSet;
