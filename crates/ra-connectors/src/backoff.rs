//! Retry budget and exponential backoff for investigation calls.

use ra_core::clock::duration_secs;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff bounded by an attempt cap and an overall deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    /// Maximum number of backend calls.
    pub max_attempts: u32,
    /// Maximum time since the first call.
    #[serde(with = "duration_secs")]
    pub deadline: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
            deadline: Duration::from_secs(5 * 60),
        }
    }
}

impl BackoffPolicy {
    /// `min(base * 2^attempt, max)` for a zero-based attempt index.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether no further call may be made.
    pub fn is_exhausted(&self, attempts: u32, elapsed: Duration) -> bool {
        attempts >= self.max_attempts || elapsed >= self.deadline
    }
}
