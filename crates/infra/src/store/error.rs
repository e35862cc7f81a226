//! Store error model and retry classification.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Transport fragments that mark an error as transient.
const RETRYABLE_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "connection aborted",
    "connection closed",
    "broken pipe",
    "eof",
    "no route to host",
    "network is unreachable",
    "i/o error",
    "loading",
    "tryagain",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The connection could not be used (refused, reset, dropped).
    #[error("store connection error: {0}")]
    Connection(String),

    /// A round trip did not finish within the configured bound.
    #[error("store operation timed out: {0}")]
    Timeout(String),

    /// The store rejected or failed a command.
    #[error("store command error: {0}")]
    Command(String),

    /// A reply had an unexpected shape.
    #[error("unexpected store reply: {0}")]
    Protocol(String),

    /// A key or entry that must exist did not.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Release attempted by a holder whose token does not match.
    #[error("lock not acquired")]
    LockNotAcquired,

    /// The client has been closed.
    #[error("store client is closed")]
    Closed,

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        source: Box<StoreError>,
    },
}

impl StoreError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Whether retrying the same operation may succeed.
    ///
    /// Only transport conditions qualify. Not-found, validation, lock
    /// contention and already-exhausted errors are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Connection(_) | StoreError::Timeout(_) => true,
            StoreError::Command(msg) => is_transient_message(msg),
            _ => false,
        }
    }
}

/// Classify a raw error message against the transient transport patterns.
pub fn is_transient_message(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p))
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        use redis::ErrorKind;

        if err.is_timeout() {
            StoreError::Timeout(err.to_string())
        } else if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            StoreError::Connection(err.to_string())
        } else {
            match err.kind() {
                ErrorKind::BusyLoadingError | ErrorKind::TryAgain | ErrorKind::ClusterDown => {
                    StoreError::Connection(err.to_string())
                }
                ErrorKind::TypeError => StoreError::Protocol(err.to_string()),
                _ => StoreError::Command(err.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        assert!(StoreError::connection("refused").is_retryable());
        assert!(StoreError::Timeout("GET".into()).is_retryable());
        assert!(StoreError::command("read: connection reset by peer").is_retryable());
        assert!(StoreError::command("write: broken pipe").is_retryable());
        assert!(StoreError::command("unexpected EOF").is_retryable());
        assert!(StoreError::command("dial tcp: no route to host").is_retryable());
        assert!(StoreError::command("LOADING Redis is loading the dataset").is_retryable());
    }

    #[test]
    fn terminal_errors_are_not_retryable() {
        assert!(!StoreError::NotFound("task:dispatched".into()).is_retryable());
        assert!(!StoreError::command("WRONGTYPE Operation against a key").is_retryable());
        assert!(!StoreError::invalid_argument("lock TTL must be greater than zero").is_retryable());
        assert!(!StoreError::LockNotAcquired.is_retryable());
        assert!(!StoreError::Closed.is_retryable());

        let exhausted = StoreError::RetriesExhausted {
            operation: "xadd".into(),
            attempts: 3,
            source: Box::new(StoreError::connection("refused")),
        };
        assert!(!exhausted.is_retryable());
        assert_eq!(
            exhausted.to_string(),
            "xadd failed after 3 attempts: store connection error: refused"
        );
    }
}
