//! Cursor tracking for confirmation consumers.
//!
//! Confirmations are applied in sequence order and the tracker refuses to
//! move backwards, so a misbehaving source cannot replay or silently skip
//! history.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::confirmation::Confirmation;

/// Position in a confirmation source (last consumed sequence number).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfirmationCursor(u64);

impl ConfirmationCursor {
    /// Before the first confirmation.
    pub const START: ConfirmationCursor = ConfirmationCursor(0);

    pub const fn at(sequence: u64) -> Self {
        Self(sequence)
    }

    pub fn last_sequence(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CursorError {
    #[error("confirmation sequence went backwards (last {last}, found {found})")]
    NonMonotonic { last: u64, found: u64 },
}

/// Tracks consumption progress over one source.
#[derive(Debug, Clone, Default)]
pub struct CursorTracker {
    cursor: ConfirmationCursor,
}

impl CursorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a previously persisted position.
    pub fn resume_from(cursor: ConfirmationCursor) -> Self {
        Self { cursor }
    }

    pub fn position(&self) -> ConfirmationCursor {
        self.cursor
    }

    /// Accept a single confirmation, enforcing strictly increasing sequences.
    pub fn observe(&mut self, confirmation: &Confirmation) -> Result<(), CursorError> {
        if confirmation.sequence <= self.cursor.0 {
            return Err(CursorError::NonMonotonic {
                last: self.cursor.0,
                found: confirmation.sequence,
            });
        }
        self.cursor = ConfirmationCursor(confirmation.sequence);
        Ok(())
    }

    /// Move to the cursor a source reported for a batch.
    ///
    /// Standing still is allowed (empty batch); regressing is not.
    pub fn advance_to(&mut self, cursor: ConfirmationCursor) -> Result<(), CursorError> {
        if cursor < self.cursor {
            return Err(CursorError::NonMonotonic {
                last: self.cursor.0,
                found: cursor.0,
            });
        }
        self.cursor = cursor;
        Ok(())
    }
}
