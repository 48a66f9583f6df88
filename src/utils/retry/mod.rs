//! Fixed-delay retry policy.
//!
//! Connection establishment and single-event publish both retry a bounded
//! number of times with a constant pause between attempts. The policy is
//! expressed once here and handed to `backon` where a retry loop is needed.

use std::time::Duration;

use backon::ConstantBuilder;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_attempts: usize,
    /// Pause between consecutive attempts.
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Effective number of attempts.
    pub fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }

    /// Check if another attempt should be made after `attempt` (0-indexed) failed.
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt + 1 < self.attempts()
    }

    /// Backoff yielding one constant delay per retry (attempts - 1 of them).
    pub fn backoff(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(self.delay)
            .with_max_times(self.attempts() - 1)
    }
}
