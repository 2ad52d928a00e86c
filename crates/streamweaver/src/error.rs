//! Error types for the streaming core.
//!
//! Uses `thiserror` for structured error handling. Backpressure drops are
//! deliberately not errors: `publish` reports them through its boolean
//! result so producers can keep going.

use std::time::Duration;

/// Errors surfaced by the streaming facade.
#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    /// Subscribe or status was requested for an unknown session.
    #[error("Session not found: {session_id}")]
    SessionNotFound {
        /// The session ID that was looked up.
        session_id: String,
    },

    /// An event was added to a batcher after `close`.
    #[error("Batcher is closed")]
    BatcherClosed,

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StreamError {
    /// Create a session-not-found error.
    #[must_use]
    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound { session_id: session_id.into() }
    }

    /// Returns true if this error maps to HTTP 404.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound { .. })
    }
}

/// Waiting on an empty queue exceeded the caller's deadline.
///
/// Recovered locally by the stream loop; it exists so blocked reads yield
/// for cancellation checks rather than to bound delivery latency.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Timed out after {0:?} waiting for an event")]
pub struct RecvTimeout(pub Duration);

/// Result type alias for facade operations.
pub type StreamResult<T> = Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_not_found_display() {
        let err = StreamError::session_not_found("abc");
        assert_eq!(err.to_string(), "Session not found: abc");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_batcher_closed_not_found_mapping() {
        let err = StreamError::BatcherClosed;
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "Batcher is closed");
    }

    #[test]
    fn test_recv_timeout_display() {
        let err = RecvTimeout(Duration::from_secs(15));
        assert!(err.to_string().contains("15s"));
    }
}
