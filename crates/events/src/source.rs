//! Cursor-based confirmation source abstraction.

use async_trait::async_trait;

use crate::confirmation::Confirmation;
use crate::cursor::ConfirmationCursor;

/// A page of confirmations and the cursor to resume from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmationBatch {
    /// Ordered by ascending sequence
    pub events: Vec<Confirmation>,
    /// Position after the last event in `events` (unchanged when empty)
    pub cursor: ConfirmationCursor,
}

/// Produces confirmations after a given cursor.
///
/// Implementations may poll, subscribe or replay; consumers only see batches.
/// Returning an empty batch with the same cursor means "nothing new yet".
#[async_trait]
pub trait ConfirmationSource: Send + Sync {
    async fn next_batch(&self, since: ConfirmationCursor) -> anyhow::Result<ConfirmationBatch>;
}
