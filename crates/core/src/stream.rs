//! Lifecycle streams and task states.
//!
//! A task lives in exactly one of four durable streams at a time:
//!
//! | Stream        | Key                | Role                                   |
//! |---------------|--------------------|----------------------------------------|
//! | `dispatched`  | `task:dispatched`  | awaiting external confirmation         |
//! | `completed`   | `task:completed`   | terminal success record                |
//! | `failed`      | `task:failed`      | terminal failure record                |
//! | `retry`       | `task:retry`       | staged for re-dispatch (not a state)   |

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// One of the four lifecycle streams.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStream {
    Dispatched,
    Completed,
    Failed,
    Retry,
}

impl LifecycleStream {
    /// All streams, in creation order.
    pub const ALL: [LifecycleStream; 4] = [
        LifecycleStream::Dispatched,
        LifecycleStream::Completed,
        LifecycleStream::Failed,
        LifecycleStream::Retry,
    ];

    /// Store key of the stream.
    pub fn key(&self) -> &'static str {
        match self {
            LifecycleStream::Dispatched => "task:dispatched",
            LifecycleStream::Completed => "task:completed",
            LifecycleStream::Failed => "task:failed",
            LifecycleStream::Retry => "task:retry",
        }
    }

    /// Short name used in logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleStream::Dispatched => "dispatched",
            LifecycleStream::Completed => "completed",
            LifecycleStream::Failed => "failed",
            LifecycleStream::Retry => "retry",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.key() == key)
    }

    /// Terminal streams never need lookup by handle after append.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleStream::Completed | LifecycleStream::Failed)
    }

    /// Logical state of a task residing in this stream.
    ///
    /// `retry` is a staging area, not a state of its own.
    pub fn state(&self) -> Option<TaskState> {
        match self {
            LifecycleStream::Dispatched => Some(TaskState::Dispatched),
            LifecycleStream::Completed => Some(TaskState::Completed),
            LifecycleStream::Failed => Some(TaskState::Failed),
            LifecycleStream::Retry => None,
        }
    }
}

impl core::fmt::Display for LifecycleStream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LifecycleStream {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stream| stream.name() == s || stream.key() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown lifecycle stream `{}`", s)))
    }
}

/// Logical task state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Entered only via enqueue.
    Dispatched,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Dispatched)
    }

    pub fn stream(&self) -> LifecycleStream {
        match self {
            TaskState::Dispatched => LifecycleStream::Dispatched,
            TaskState::Completed => LifecycleStream::Completed,
            TaskState::Failed => LifecycleStream::Failed,
        }
    }
}
