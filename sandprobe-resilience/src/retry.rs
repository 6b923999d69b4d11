//! Retry policy and executor

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::classify::{ErrorClassifier, ErrorKind};

/// Retry policy configuration
///
/// At least one of `max_attempts` and `time_limit` must be set. When both
/// are set, whichever budget runs out first ends the loop. Fields missing
/// from a config file leave both budgets unset rather than borrowing them
/// from `RetryPolicy::default()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Wall-clock budget measured from the start of the first attempt
    #[serde(default, with = "humantime_serde")]
    pub time_limit: Option<Duration>,

    /// Delay after the first failed attempt
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound on any single delay
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Whether to add jitter to retry delays
    #[serde(default)]
    pub jitter: bool,

    /// Error kinds worth another attempt
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<ErrorKind>,
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_retry_on() -> Vec<ErrorKind> {
    ErrorKind::RETRYABLE_BY_DEFAULT.to_vec()
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::attempts(6, default_base_delay(), default_max_delay())
    }
}

impl RetryPolicy {
    /// Policy bounded by a fixed number of attempts
    pub fn attempts(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            time_limit: None,
            base_delay,
            max_delay,
            jitter: false,
            retry_on: ErrorKind::RETRYABLE_BY_DEFAULT.to_vec(),
        }
    }

    /// Policy bounded by a wall-clock deadline, polling at a fixed interval
    pub fn time_bounded(time_limit: Duration, interval: Duration) -> Self {
        Self {
            max_attempts: None,
            time_limit: Some(time_limit),
            base_delay: interval,
            max_delay: interval,
            jitter: false,
            retry_on: ErrorKind::RETRYABLE_BY_DEFAULT.to_vec(),
        }
    }

    /// Exactly one attempt, no retries
    pub fn single_attempt() -> Self {
        Self::attempts(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_time_limit(mut self, time_limit: Duration) -> Self {
        self.time_limit = Some(time_limit);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retry_on = kinds.into_iter().collect();
        self
    }

    /// Check the policy invariants
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_attempts.is_none() && self.time_limit.is_none() {
            return Err(PolicyError::Unbounded);
        }
        if self.max_attempts == Some(0) {
            return Err(PolicyError::ZeroAttempts);
        }
        if self.base_delay > self.max_delay {
            return Err(PolicyError::BaseExceedsMax {
                base_delay: self.base_delay,
                max_delay: self.max_delay,
            });
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.base_delay, self.max_delay).with_jitter(self.jitter)
    }

    /// Delay after the failed attempt with the given zero-based index
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        self.backoff().delay(attempt_index)
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retry_on.contains(&kind)
    }

    /// Attempt budget as enforced by the executor
    ///
    /// A policy with neither budget set runs exactly once.
    fn attempt_budget(&self) -> Option<u32> {
        match (self.max_attempts, self.time_limit) {
            (Some(max), _) => Some(max.max(1)),
            (None, Some(_)) => None,
            (None, None) => Some(1),
        }
    }
}

/// Invalid retry policy
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("retry policy needs max_attempts or time_limit")]
    Unbounded,

    #[error("max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("base_delay {base_delay:?} exceeds max_delay {max_delay:?}")]
    BaseExceedsMax {
        base_delay: Duration,
        max_delay: Duration,
    },
}

/// Successful outcome of a retried operation
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    /// Attempts made, including the successful one
    pub attempts: u32,
    /// Time from the start of the first attempt to success
    pub elapsed: Duration,
}

impl<T> Retried<T> {
    pub fn into_inner(self) -> T {
        self.value
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Retried<U> {
        Retried {
            value: f(self.value),
            attempts: self.attempts,
            elapsed: self.elapsed,
        }
    }
}

/// Retry executor
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create a new retry executor with the given policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute a function with retry logic
    pub async fn execute<F, Fut, T, E, C>(
        &self,
        classifier: &C,
        mut f: F,
    ) -> Result<Retried<T>, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        C: ErrorClassifier<E> + ?Sized,
    {
        self.execute_with_context(classifier, |_attempt| f()).await
    }

    /// Execute a function with retry logic and the 1-based attempt number
    ///
    /// Attempts are strictly sequential. An attempt is never started once
    /// the time budget would be exceeded by the preceding backoff delay, but
    /// the first attempt always runs.
    pub async fn execute_with_context<F, Fut, T, E, C>(
        &self,
        classifier: &C,
        mut f: F,
    ) -> Result<Retried<T>, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        C: ErrorClassifier<E> + ?Sized,
    {
        let started = Instant::now();
        let attempt_budget = self.policy.attempt_budget();
        let mut attempt = 1;

        loop {
            debug!(attempt, max_attempts = ?attempt_budget, "Executing attempt");

            let error = match f(attempt).await {
                Ok(value) => {
                    let elapsed = started.elapsed();
                    if attempt > 1 {
                        info!(attempts = attempt, ?elapsed, "Operation succeeded after retries");
                    }
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                        elapsed,
                    });
                }
                Err(error) => error,
            };

            let kind = classifier.classify(&error);
            let elapsed = started.elapsed();

            if !self.policy.is_retryable(kind) {
                warn!(attempt, %kind, "Operation failed with non-retryable error: {}", error);
                return Err(RetryError::NonRetryable {
                    kind,
                    attempts: attempt,
                    elapsed,
                    last_error: error,
                });
            }

            if attempt_budget.is_some_and(|max| attempt >= max) {
                warn!(attempt, %kind, "Operation failed after {} attempts: {}", attempt, error);
                return Err(RetryError::Exhausted {
                    kind,
                    attempts: attempt,
                    elapsed,
                    last_error: error,
                });
            }

            let delay = self.policy.delay_for_attempt(attempt - 1);

            if let Some(limit) = self.policy.time_limit {
                if elapsed.saturating_add(delay) >= limit {
                    warn!(attempt, ?elapsed, ?limit, %kind, "Time budget exhausted: {}", error);
                    return Err(RetryError::Exhausted {
                        kind,
                        attempts: attempt,
                        elapsed,
                        last_error: error,
                    });
                }
            }

            warn!(
                attempt,
                %kind,
                delay_ms = delay.as_millis() as u64,
                "Attempt failed: {}. Retrying in {:?}",
                error,
                delay
            );
            sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Retry error types
///
/// Both variants carry the last observed failure together with the attempt
/// count and elapsed time.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Failure classified as not worth retrying
    #[error("{kind} error after {attempts} attempt(s) in {elapsed:.2?}: {last_error}")]
    NonRetryable {
        kind: ErrorKind,
        attempts: u32,
        elapsed: Duration,
        last_error: E,
    },

    /// Attempt or time budget ran out
    #[error("gave up after {attempts} attempt(s) in {elapsed:.2?}, last {kind} error: {last_error}")]
    Exhausted {
        kind: ErrorKind,
        attempts: u32,
        elapsed: Duration,
        last_error: E,
    },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::NonRetryable { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            RetryError::NonRetryable { elapsed, .. } | RetryError::Exhausted { elapsed, .. } => {
                *elapsed
            }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RetryError::NonRetryable { kind, .. } | RetryError::Exhausted { kind, .. } => *kind,
        }
    }

    pub fn last_error(&self) -> &E {
        match self {
            RetryError::NonRetryable { last_error, .. }
            | RetryError::Exhausted { last_error, .. } => last_error,
        }
    }

    /// Get the underlying error
    pub fn into_inner(self) -> E {
        match self {
            RetryError::NonRetryable { last_error, .. }
            | RetryError::Exhausted { last_error, .. } => last_error,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    pub fn map_err<F, U>(self, f: F) -> RetryError<U>
    where
        F: FnOnce(E) -> U,
    {
        match self {
            RetryError::NonRetryable {
                kind,
                attempts,
                elapsed,
                last_error,
            } => RetryError::NonRetryable {
                kind,
                attempts,
                elapsed,
                last_error: f(last_error),
            },
            RetryError::Exhausted {
                kind,
                attempts,
                elapsed,
                last_error,
            } => RetryError::Exhausted {
                kind,
                attempts,
                elapsed,
                last_error: f(last_error),
            },
        }
    }
}
