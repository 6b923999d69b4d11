//! Error classification for retry decisions
//!
//! A failure observed at the remote-service boundary is mapped onto a small
//! closed set of [`ErrorKind`]s. Errors that carry their own tag are
//! classified by matching on it; untagged errors fall back to
//! [`MessageClassifier`], which inspects the error's type name and message.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of an observed failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network-layer failure or timeout
    Transient,
    /// Resource not (yet) visible, or gone
    NotFound,
    /// Resource exists but is in the wrong state for the operation
    StateConflict,
    /// Anything else: bad arguments, permissions, unexpected responses
    Fatal,
}

impl ErrorKind {
    /// Kinds retried when a policy does not say otherwise
    pub const RETRYABLE_BY_DEFAULT: [ErrorKind; 3] = [
        ErrorKind::Transient,
        ErrorKind::NotFound,
        ErrorKind::StateConflict,
    ];

    pub fn is_retryable_by_default(self) -> bool {
        Self::RETRYABLE_BY_DEFAULT.contains(&self)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::NotFound => write!(f, "not-found"),
            ErrorKind::StateConflict => write!(f, "state-conflict"),
            ErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// An error paired with its classification
#[derive(Debug, Clone, Copy)]
pub struct ClassifiedError<'a, E: ?Sized> {
    pub raw: &'a E,
    pub kind: ErrorKind,
}

/// Minimal description of an error for message-based classification
pub trait DescribeError {
    /// Type or variant name of the error (e.g. `ReadTimeout`)
    fn type_name(&self) -> &str;

    /// Human-readable message
    fn message(&self) -> String;
}

/// Decides which [`ErrorKind`] an error belongs to
pub trait ErrorClassifier<E: ?Sized>: Send + Sync {
    fn classify(&self, error: &E) -> ErrorKind;

    fn classified<'a>(&self, error: &'a E) -> ClassifiedError<'a, E> {
        ClassifiedError {
            raw: error,
            kind: self.classify(error),
        }
    }
}

/// Substring-matching classifier for untagged errors
///
/// Matching is case-insensitive over both the type name and the message.
/// State conflicts are checked first, then not-found, then transient
/// network failures; anything unmatched is fatal.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageClassifier;

const STATE_CONFLICT_PATTERNS: &[&str] = &["can't be resumed", "cannot be resumed"];
const NOT_FOUND_PATTERNS: &[&str] = &["not found", "sandbox was not found"];
const NOT_FOUND_NAMES: &[&str] = &["notfound", "not_found", "not-found"];
const TRANSIENT_PATTERNS: &[&str] = &["timeout", "timed out", "read timeout", "connection"];
const TRANSIENT_NAMES: &[&str] = &["readtimeout", "timeoutexception", "timeout", "connection"];

impl MessageClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify from a raw type name and message
    pub fn classify_parts(&self, type_name: &str, message: &str) -> ErrorKind {
        let name = type_name.to_lowercase();
        let text = message.to_lowercase();

        if contains_any(&text, STATE_CONFLICT_PATTERNS) {
            ErrorKind::StateConflict
        } else if contains_any(&text, NOT_FOUND_PATTERNS) || contains_any(&name, NOT_FOUND_NAMES) {
            ErrorKind::NotFound
        } else if contains_any(&text, TRANSIENT_PATTERNS) || contains_any(&name, TRANSIENT_NAMES) {
            ErrorKind::Transient
        } else {
            ErrorKind::Fatal
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

impl<E: DescribeError + ?Sized> ErrorClassifier<E> for MessageClassifier {
    fn classify(&self, error: &E) -> ErrorKind {
        self.classify_parts(error.type_name(), &error.message())
    }
}

/// Classifier built from a closure
pub struct FnClassifier<F>(pub F);

impl<E: ?Sized, F> ErrorClassifier<E> for FnClassifier<F>
where
    F: Fn(&E) -> ErrorKind + Send + Sync,
{
    fn classify(&self, error: &E) -> ErrorKind {
        (self.0)(error)
    }
}
