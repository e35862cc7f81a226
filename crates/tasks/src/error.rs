//! Lifecycle error model.

use thiserror::Error;

use taskrelay_core::DomainError;
use taskrelay_events::CursorError;
use taskrelay_infra::StoreError;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LifecycleError {
    /// Streams or consumer groups could not be set up.
    #[error("failed to initialize lifecycle streams: {0}")]
    Initialization(#[source] StoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Cursor(#[from] CursorError),

    /// The confirmation source failed to produce a batch.
    #[error("confirmation source failed: {0}")]
    Source(String),

    #[error("invalid lifecycle configuration: {0}")]
    Config(String),

    #[error("task lifecycle manager is closed")]
    Closed,
}

impl LifecycleError {
    /// Whether the failure came from the store being unreachable.
    pub fn is_transient(&self) -> bool {
        match self {
            LifecycleError::Store(e) | LifecycleError::Initialization(e) => match e {
                StoreError::RetriesExhausted { source, .. } => source.is_retryable(),
                other => other.is_retryable(),
            },
            _ => false,
        }
    }
}
