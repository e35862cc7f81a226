//! Task lifecycle building blocks.
//!
//! This crate contains **pure** primitives shared by every layer: identifiers,
//! the task record and the lifecycle stream vocabulary. No store or runtime
//! concerns live here.

pub mod error;
pub mod id;
pub mod stream;
pub mod task;

pub use error::{DomainError, DomainResult};
pub use id::{EntryId, JobId, TaskId};
pub use stream::{LifecycleStream, TaskState};
pub use task::TaskRecord;
