//! Retry policy with bounded exponential backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// Bounded retry policy.
///
/// Attempt `n` (1-based) that fails with a retryable error is followed by a
/// sleep of `min(initial_backoff_ms * multiplier^(n-1), max_backoff_ms)`,
/// plus up to `jitter_percent` percent of random jitter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Backoff before the second attempt, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound on any single backoff, in milliseconds.
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive backoffs.
    pub multiplier: f64,
    /// Random jitter added on top of each backoff, as a percentage of it.
    pub jitter_percent: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 250,
            max_backoff_ms: 8_000,
            multiplier: 2.0,
            jitter_percent: 10,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
            jitter_percent: 0,
        }
    }

    /// A policy with `max_attempts` attempts, fixed-growth backoff and no jitter.
    #[must_use]
    pub const fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: initial.as_millis() as u64,
            max_backoff_ms: max.as_millis() as u64,
            multiplier: 2.0,
            jitter_percent: 0,
        }
    }

    /// Number of attempts actually made.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Deterministic backoff after failed attempt `attempt` (1-based), without jitter.
    #[must_use]
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = raw.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Backoff after failed attempt `attempt`, including jitter.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt);
        if self.jitter_percent == 0 || base.is_zero() {
            return base;
        }
        let base_ms = base.as_millis() as u64;
        let range = (base_ms.saturating_mul(u64::from(self.jitter_percent)) / 100).max(1);
        let jitter = rand::rng().random_range(0..range);
        Duration::from_millis(base_ms + jitter)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are exhausted. `op` receives the 1-based attempt number.
    ///
    /// # Errors
    /// Returns the first non-retryable error, or the last error once all
    /// attempts have failed.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let wait = self.backoff(attempt);
                    debug!(
                        operation,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "Retryable failure, backing off"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(operation, attempts, error = %e, "Retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}
