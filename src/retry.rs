//! Bounded exponential backoff for transient failures.

use std::thread;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::{CancellationToken, Error, Result};

/// Retry policy: how many attempts and how long to wait between them.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        RetryPolicy::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Same backoff, different attempt budget.
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            ..self.clone()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before attempt `attempt + 1`, given that `attempt` just failed.
    ///
    /// A server-provided delay is used as given; only the computed backoff
    /// is capped at `max_backoff`.
    pub fn delay(&self, attempt: u32, err: &Error) -> Duration {
        err.retry_after().unwrap_or_else(|| {
            self.initial_backoff
                .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
                .min(self.max_backoff)
        })
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of attempts.
    pub fn run<T, F>(&self, what: &str, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        self.run_cancellable(what, &CancellationToken::new(), op)
    }

    /// Like [`run`](Self::run), but stops between attempts once `cancel` fires.
    pub fn run_cancellable<T, F>(&self, what: &str, cancel: &CancellationToken, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        self.run_with(what, cancel, Error::is_transient, op)
    }

    /// Retry loop with a caller-chosen notion of "worth retrying".
    pub fn run_with<T, F, P>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        retryable: P,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
        P: Fn(&Error) -> bool,
    {
        let mut attempt = 1;
        loop {
            cancel.check()?;
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if retryable(&e) && attempt < self.max_attempts => {
                    let delay = self.delay(attempt, &e);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "{} failed, retrying",
                        what
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy::new(
            config.max_attempts,
            config.initial_backoff(),
            config.max_backoff(),
        )
    }
}
