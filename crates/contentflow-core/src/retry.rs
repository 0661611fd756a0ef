//! Retry and backoff policy for stages.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How often a stage may be attempted and how long to wait between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub retry_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub backoff_factor: f64,
    /// Upper bound for the delay.
    pub max_retry_delay: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);
    pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
    pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

    /// A policy with a fixed delay and no growth.
    pub fn fixed(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            max_attempts,
            retry_delay,
            backoff_factor: 1.0,
            max_retry_delay: retry_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            retry_delay: Self::DEFAULT_RETRY_DELAY,
            backoff_factor: Self::DEFAULT_BACKOFF_FACTOR,
            max_retry_delay: Self::DEFAULT_MAX_RETRY_DELAY,
        }
    }
}

/// Exponential growth `current * factor`, capped at `max`.
pub fn grow_delay(current: Duration, factor: f64, max: Duration) -> Duration {
    let factor = if factor.is_finite() && factor >= 1.0 {
        factor
    } else {
        1.0
    };
    let grown = current.as_secs_f64() * factor;
    if grown >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(grown)
    }
}
