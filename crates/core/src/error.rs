//! Errors raised by the pure task primitives.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic failures: bad input, bad identifiers, undecodable records.
/// Store and transport failures live in `taskrelay-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// An id or stream entry id did not parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A stored task record could not be encoded or decoded.
    #[error("malformed task record: {0}")]
    MalformedRecord(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedRecord(msg.into())
    }
}
