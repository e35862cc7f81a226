//! In-memory confirmation source for tests/dev.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use taskrelay_core::TaskId;

use crate::confirmation::Confirmation;
use crate::cursor::ConfirmationCursor;
use crate::source::{ConfirmationBatch, ConfirmationSource};

const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Default)]
struct SourceState {
    events: Vec<Confirmation>,
    last_sequence: u64,
}

/// Append-only list of confirmations, paged by sequence number.
#[derive(Debug)]
pub struct InMemoryConfirmationSource {
    state: Mutex<SourceState>,
    batch_size: usize,
}

impl Default for InMemoryConfirmationSource {
    fn default() -> Self {
        Self {
            state: Mutex::new(SourceState::default()),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl InMemoryConfirmationSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Record a completion; returns its sequence number.
    pub fn push_completed(&self, task_id: TaskId) -> u64 {
        self.push_with(|seq| Confirmation::completed(seq, task_id))
    }

    /// Record a rejection; returns its sequence number.
    pub fn push_rejected(&self, task_id: TaskId, reason: impl Into<String>) -> u64 {
        let reason = reason.into();
        self.push_with(|seq| Confirmation::rejected(seq, task_id, reason))
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push_with(&self, build: impl FnOnce(u64) -> Confirmation) -> u64 {
        let mut state = self.lock();
        state.last_sequence += 1;
        let seq = state.last_sequence;
        state.events.push(build(seq));
        seq
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ConfirmationSource for InMemoryConfirmationSource {
    async fn next_batch(&self, since: ConfirmationCursor) -> anyhow::Result<ConfirmationBatch> {
        let state = self.lock();
        let events: Vec<Confirmation> = state
            .events
            .iter()
            .filter(|c| c.sequence > since.last_sequence())
            .take(self.batch_size)
            .cloned()
            .collect();

        let cursor = events
            .last()
            .map(|c| ConfirmationCursor::at(c.sequence))
            .unwrap_or(since);

        Ok(ConfirmationBatch { events, cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConfirmationOutcome;

    #[tokio::test]
    async fn pages_confirmations_after_cursor() {
        let source = InMemoryConfirmationSource::new().with_batch_size(2);
        source.push_completed(TaskId::new(1));
        source.push_rejected(TaskId::new(2), "bad proof");
        source.push_completed(TaskId::new(3));

        let first = source.next_batch(ConfirmationCursor::START).await.unwrap();
        assert_eq!(first.events.len(), 2);
        assert_eq!(first.cursor, ConfirmationCursor::at(2));
        assert_eq!(
            first.events[1].outcome,
            ConfirmationOutcome::Rejected {
                reason: "bad proof".to_string()
            }
        );

        let second = source.next_batch(first.cursor).await.unwrap();
        assert_eq!(second.events.len(), 1);
        assert_eq!(second.events[0].task_id, TaskId::new(3));

        let idle = source.next_batch(second.cursor).await.unwrap();
        assert!(idle.events.is_empty());
        assert_eq!(idle.cursor, second.cursor);
    }
}
