//! Backoff delay calculation for retry policies

use rand::Rng;
use std::time::Duration;

/// Capped exponential backoff
///
/// `delay(i) = min(base_delay * 2^i, max_delay)` for a zero-based attempt
/// index. Jitter is off unless explicitly enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl BackoffPolicy {
    /// Create a new exponential backoff without jitter
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    /// Fixed interval between attempts
    pub fn fixed(interval: Duration) -> Self {
        Self::new(interval, interval)
    }

    /// Enable or disable ±20% jitter on every computed delay
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay to wait after the failed attempt with the given zero-based index
    pub fn delay(&self, attempt_index: u32) -> Duration {
        let capped = self.exponential(attempt_index).min(self.max_delay);

        if self.jitter {
            add_jitter(capped)
        } else {
            capped
        }
    }

    /// Sum of the un-jittered delays for the first `attempts` failures
    pub fn total_delay(&self, attempts: u32) -> Duration {
        (0..attempts).fold(Duration::ZERO, |acc, i| {
            acc.saturating_add(self.exponential(i).min(self.max_delay))
        })
    }

    fn exponential(&self, attempt_index: u32) -> Duration {
        match 1u32.checked_shl(attempt_index) {
            Some(multiplier) => self.base_delay.saturating_mul(multiplier),
            None => Duration::MAX,
        }
    }
}

fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor = rng.gen_range(0.8..1.2);
    Duration::from_nanos((delay.as_nanos() as f64 * factor) as u64)
}
