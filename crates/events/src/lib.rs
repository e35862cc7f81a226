//! Confirmation events reported by external observers.
//!
//! A confirmation source (e.g. a chain-event observer) reports, asynchronously,
//! whether a dispatched task completed or was rejected. This crate defines the
//! event shape, the cursor-based source abstraction and an in-memory source for
//! tests/dev. It makes no assumptions about how confirmations are produced.

pub mod confirmation;
pub mod cursor;
pub mod in_memory_source;
pub mod source;

pub use confirmation::{Confirmation, ConfirmationOutcome};
pub use cursor::{ConfirmationCursor, CursorError, CursorTracker};
pub use in_memory_source::InMemoryConfirmationSource;
pub use source::{ConfirmationBatch, ConfirmationSource};
