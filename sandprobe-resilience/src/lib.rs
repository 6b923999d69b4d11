//! Resilience patterns for sandprobe
//!
//! This crate provides capped exponential backoff, retry policies bounded by
//! attempts or wall-clock time, and the error classification that decides
//! which failures are worth another attempt.

pub mod backoff;
pub mod classify;
pub mod retry;

// Re-export commonly used types
pub use backoff::BackoffPolicy;
pub use classify::{
    ClassifiedError, DescribeError, ErrorClassifier, ErrorKind, FnClassifier, MessageClassifier,
};
pub use retry::{PolicyError, Retried, RetryError, RetryExecutor, RetryPolicy};
