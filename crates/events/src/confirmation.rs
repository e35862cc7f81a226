//! Confirmation event shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskrelay_core::TaskId;

/// What the observer saw happen to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConfirmationOutcome {
    /// The performer's result was accepted.
    Completed,
    /// The performer's result was rejected (or the performer refused the task).
    Rejected { reason: String },
}

/// A single confirmation, positioned by a source-assigned sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    /// Strictly increasing within one source
    pub sequence: u64,
    pub task_id: TaskId,
    #[serde(flatten)]
    pub outcome: ConfirmationOutcome,
    pub observed_at: DateTime<Utc>,
}

impl Confirmation {
    pub fn completed(sequence: u64, task_id: TaskId) -> Self {
        Self {
            sequence,
            task_id,
            outcome: ConfirmationOutcome::Completed,
            observed_at: Utc::now(),
        }
    }

    pub fn rejected(sequence: u64, task_id: TaskId, reason: impl Into<String>) -> Self {
        Self {
            sequence,
            task_id,
            outcome: ConfirmationOutcome::Rejected {
                reason: reason.into(),
            },
            observed_at: Utc::now(),
        }
    }
}
