//! Bounded retry with linear backoff.

use std::time::Duration;

use tracing::warn;

use crate::clock::Clock;
use crate::error::Result;

/// How many times to attempt an operation and how long to wait in between.
///
/// The wait before attempt `n + 1` is `backoff * n`. Only errors for which
/// [`ArchiveError::is_transient`](crate::error::ArchiveError::is_transient)
/// returns true are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Treated as at least 1.
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    /// Run `op`, retrying transient failures. `what` labels the log lines.
    pub fn run<T, C, F>(&self, clock: &C, what: &str, mut op: F) -> Result<T>
    where
        C: Clock + ?Sized,
        F: FnMut() -> Result<T>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.backoff * attempt;
                    warn!(
                        operation = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    clock.sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
