//! Session error types

use crate::session::SessionState;
use sandprobe_client::{ServiceError, ServiceErrorClassifier};
use sandprobe_resilience::{ErrorClassifier, ErrorKind, RetryError};

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Single service call failed
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// Retried service operation gave up
    #[error("{operation} failed: {source}")]
    Retry {
        operation: &'static str,
        #[source]
        source: RetryError<ServiceError>,
    },

    /// A capability answered but with the wrong result
    #[error("not ready: {0}")]
    Unready(String),

    /// Content read back differs from what was written
    #[error("content mismatch at {path}: expected {expected:?}, got {actual:?}")]
    Mismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("cannot {operation} sandbox {sandbox_id} in state {state}")]
    InvalidState {
        sandbox_id: String,
        state: SessionState,
        operation: &'static str,
    },
}

impl SessionError {
    pub(crate) fn retry(operation: &'static str, source: RetryError<ServiceError>) -> Self {
        SessionError::Retry { operation, source }
    }

    /// Attempts made before this error surfaced, 1 for unretried failures
    pub fn attempts(&self) -> u32 {
        match self {
            SessionError::Retry { source, .. } => source.attempts(),
            _ => 1,
        }
    }

    /// Underlying service error, if any
    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            SessionError::Service(error) => Some(error),
            SessionError::Retry { source, .. } => Some(source.last_error()),
            _ => None,
        }
    }
}

/// Classifies [`SessionError`]s for probe retries
///
/// Service failures are classified by their tag; a capability that answered
/// wrongly is treated as not ready yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionErrorClassifier {
    service: ServiceErrorClassifier,
}

impl ErrorClassifier<SessionError> for SessionErrorClassifier {
    fn classify(&self, error: &SessionError) -> ErrorKind {
        match error {
            SessionError::Service(e) => self.service.classify(e),
            SessionError::Retry { source, .. } => source.kind(),
            SessionError::Unready(_) => ErrorKind::Transient,
            SessionError::Mismatch { .. } | SessionError::InvalidState { .. } => ErrorKind::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_classification() {
        let classifier = SessionErrorClassifier::default();

        let unready = SessionError::Unready("stdout was empty".into());
        assert_eq!(classifier.classify(&unready), ErrorKind::Transient);

        let missing = SessionError::from(ServiceError::NotFound("sandbox".into()));
        assert_eq!(classifier.classify(&missing), ErrorKind::NotFound);

        let killed = SessionError::InvalidState {
            sandbox_id: "sbx1".into(),
            state: SessionState::Killed,
            operation: "pause",
        };
        assert_eq!(classifier.classify(&killed), ErrorKind::Fatal);
        assert_eq!(killed.to_string(), "cannot pause sandbox sbx1 in state killed");
    }
}
