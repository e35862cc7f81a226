//! Hand-off of dispatched tasks to performers.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

use taskrelay_core::{TaskId, TaskRecord};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The performer could not be reached.
    #[error("performer {performer} unreachable: {reason}")]
    Unreachable { performer: String, reason: String },

    /// The performer refused the task.
    #[error("performer rejected task: {0}")]
    Rejected(String),
}

/// Delivers a task to its performer.
///
/// Called after the task is durably appended to the dispatched stream; an
/// error stages the task for retry.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, task: &TaskRecord) -> Result<(), DeliveryError>;
}

#[derive(Debug, Default)]
struct Recorded {
    delivered: Vec<TaskId>,
    failures: VecDeque<DeliveryError>,
}

/// Accepts every task and remembers what it saw. Queued failures are returned
/// first, one per call.
#[derive(Debug, Default)]
pub struct RecordingDelivery {
    inner: Mutex<Recorded>,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: DeliveryError) {
        self.lock().failures.push_back(error);
    }

    /// Tasks delivered successfully, in order.
    pub fn delivered(&self) -> Vec<TaskId> {
        self.lock().delivered.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DeliverySink for RecordingDelivery {
    async fn deliver(&self, task: &TaskRecord) -> Result<(), DeliveryError> {
        let mut recorded = self.lock();
        if let Some(error) = recorded.failures.pop_front() {
            return Err(error);
        }
        recorded.delivered.push(task.task_id);
        Ok(())
    }
}
