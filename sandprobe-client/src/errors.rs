//! Service error types

use sandprobe_resilience::{DescribeError, ErrorClassifier, ErrorKind, MessageClassifier};
use serde_json::Value as JsonValue;

/// Result type for remote-service calls
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Error returned by the remote sandbox service
///
/// Every variant except [`ServiceError::Untagged`] carries its own
/// retry classification, see [`ServiceError::tag`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("state conflict: {0}")]
    Conflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("unexpected response ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    /// Error from a source that does not tag its failures
    #[error("{name}: {message}")]
    Untagged { name: String, message: String },
}

impl ServiceError {
    /// Map a non-success HTTP status and body onto a tagged error
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = error_message(body).unwrap_or_else(|| format!("HTTP {}", status));

        match status {
            404 => ServiceError::NotFound(message),
            409 => ServiceError::Conflict(message),
            400 | 422 => ServiceError::InvalidArgument(message),
            401 | 403 => ServiceError::Unauthorized(message),
            408 | 429 | 502 | 503 | 504 => ServiceError::Unavailable(message),
            _ => ServiceError::Api { status, message },
        }
    }

    pub fn untagged(name: impl Into<String>, message: impl Into<String>) -> Self {
        ServiceError::Untagged {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Classification carried by the error itself, `None` when untagged
    pub fn tag(&self) -> Option<ErrorKind> {
        match self {
            ServiceError::Timeout(_) | ServiceError::Connection(_) | ServiceError::Unavailable(_) => {
                Some(ErrorKind::Transient)
            }
            ServiceError::NotFound(_) => Some(ErrorKind::NotFound),
            ServiceError::Conflict(_) => Some(ErrorKind::StateConflict),
            ServiceError::InvalidArgument(_)
            | ServiceError::Unauthorized(_)
            | ServiceError::Api { .. }
            | ServiceError::Decode(_) => Some(ErrorKind::Fatal),
            ServiceError::Untagged { .. } => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::NotFound(_))
    }
}

/// Pull a human-readable message out of an error body
///
/// Accepts `{"message": ..}` or `{"error": ..}` JSON, otherwise the first 200
/// characters of the raw body.
fn error_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(json) = serde_json::from_str::<JsonValue>(trimmed) {
        for key in ["message", "error"] {
            if let Some(text) = json.get(key).and_then(|v| v.as_str()) {
                return Some(text.to_string());
            }
        }
    }

    Some(trimmed.chars().take(200).collect())
}

impl From<reqwest::Error> for ServiceError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ServiceError::Timeout(error.to_string())
        } else if error.is_connect() {
            ServiceError::Connection(error.to_string())
        } else if error.is_decode() {
            ServiceError::Decode(error.to_string())
        } else if error.is_builder() {
            ServiceError::InvalidArgument(error.to_string())
        } else {
            ServiceError::untagged("reqwest::Error", error.to_string())
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(error: serde_json::Error) -> Self {
        ServiceError::Decode(error.to_string())
    }
}

impl DescribeError for ServiceError {
    fn type_name(&self) -> &str {
        match self {
            ServiceError::Timeout(_) => "Timeout",
            ServiceError::Connection(_) => "Connection",
            ServiceError::Unavailable(_) => "Unavailable",
            ServiceError::NotFound(_) => "NotFound",
            ServiceError::Conflict(_) => "Conflict",
            ServiceError::InvalidArgument(_) => "InvalidArgument",
            ServiceError::Unauthorized(_) => "Unauthorized",
            ServiceError::Api { .. } => "Api",
            ServiceError::Decode(_) => "Decode",
            ServiceError::Untagged { name, .. } => name.as_str(),
        }
    }

    fn message(&self) -> String {
        match self {
            ServiceError::Untagged { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Classifies [`ServiceError`]s by tag, falling back to message matching
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceErrorClassifier {
    fallback: MessageClassifier,
}

impl ServiceErrorClassifier {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ErrorClassifier<ServiceError> for ServiceErrorClassifier {
    fn classify(&self, error: &ServiceError) -> ErrorKind {
        error
            .tag()
            .unwrap_or_else(|| self.fallback.classify(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(ServiceError::from_status(404, ""), ServiceError::NotFound(_)));
        assert!(matches!(ServiceError::from_status(409, ""), ServiceError::Conflict(_)));
        assert!(matches!(ServiceError::from_status(400, ""), ServiceError::InvalidArgument(_)));
        assert!(matches!(ServiceError::from_status(403, ""), ServiceError::Unauthorized(_)));
        assert!(matches!(ServiceError::from_status(503, ""), ServiceError::Unavailable(_)));
        assert!(matches!(
            ServiceError::from_status(500, ""),
            ServiceError::Api { status: 500, .. }
        ));
    }

    #[test]
    fn test_error_message_extraction() {
        let err = ServiceError::from_status(404, r#"{"code":404,"message":"sandbox abc not found"}"#);
        assert_eq!(err, ServiceError::NotFound("sandbox abc not found".to_string()));

        let err = ServiceError::from_status(400, r#"{"error":"bad template"}"#);
        assert_eq!(err, ServiceError::InvalidArgument("bad template".to_string()));

        let err = ServiceError::from_status(502, "");
        assert_eq!(err, ServiceError::Unavailable("HTTP 502".to_string()));

        let err = ServiceError::from_status(500, "upstream exploded");
        assert_eq!(
            err,
            ServiceError::Api {
                status: 500,
                message: "upstream exploded".to_string()
            }
        );
    }

    #[test]
    fn test_tagged_classification() {
        let classifier = ServiceErrorClassifier::new();

        assert_eq!(
            classifier.classify(&ServiceError::Timeout("read".into())),
            ErrorKind::Transient
        );
        assert_eq!(
            classifier.classify(&ServiceError::NotFound("x".into())),
            ErrorKind::NotFound
        );
        assert_eq!(
            classifier.classify(&ServiceError::Conflict("x".into())),
            ErrorKind::StateConflict
        );
        assert_eq!(
            classifier.classify(&ServiceError::InvalidArgument("x".into())),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn test_tag_wins_over_message() {
        let classifier = ServiceErrorClassifier::new();
        // message mentions a timeout but the tag says the request was malformed
        let err = ServiceError::InvalidArgument("timeout must be positive".into());
        assert_eq!(classifier.classify(&err), ErrorKind::Fatal);
    }

    #[test]
    fn test_untagged_falls_back_to_message_rules() {
        let classifier = ServiceErrorClassifier::new();

        let cases = [
            ("ReadTimeout", "boom", ErrorKind::Transient),
            ("Exception", "Read timed out", ErrorKind::Transient),
            ("SandboxException", "Sandbox was not found", ErrorKind::NotFound),
            ("NotFoundException", "404", ErrorKind::NotFound),
            ("SandboxException", "Sandbox can't be resumed", ErrorKind::StateConflict),
            ("ValueError", "invalid argument", ErrorKind::Fatal),
        ];

        for (name, message, expected) in cases {
            let err = ServiceError::untagged(name, message);
            assert_eq!(classifier.classify(&err), expected, "{}: {}", name, message);
        }
    }
}
