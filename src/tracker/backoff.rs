//! Retry policy for tracker exchanges
//!
//! Pure functions of the attempt number. The session does the actual
//! waiting, so the schedule can be tested without any clock.

use std::time::Duration;

/// Timeout of the first attempt (BEP 15)
pub const DEFAULT_INITIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Retransmissions after the first attempt (BEP 15 gives up at 15 * 2^8)
pub const DEFAULT_MAX_RETRIES: u32 = 8;

/// Exponential retransmission schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_timeout: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_timeout: DEFAULT_INITIAL_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_timeout: Duration, max_retries: u32) -> Self {
        Self {
            initial_timeout,
            max_retries,
        }
    }

    /// How long to wait for a reply to attempt `attempt` (0-based)
    pub fn next_timeout(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_timeout.saturating_mul(factor)
    }

    /// Whether attempt `attempt` may still be sent
    pub fn retry_budget(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    /// Total transmissions the budget allows
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Sum of every attempt window, i.e. the longest an exchange can take
    pub fn total_timeout(&self) -> Duration {
        (0..self.max_attempts())
            .map(|attempt| self.next_timeout(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}
