// src/retry.rs
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
    /// Builds the error reported when an attempt exceeds the per-attempt timeout.
    fn timed_out(after: Duration) -> Self;
}

/// Bounded exponential backoff applied around every external call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: u32,
    pub max_delay: Duration,
    /// Applied to each attempt individually.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2,
            max_delay: Duration::from_secs(8),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1 for the first retry), without jitter.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let factor = self.backoff_factor.max(1).saturating_pow(exponent);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    fn jittered_backoff_for(&self, retry: u32) -> Duration {
        let backoff = self.backoff_for(retry);
        let spread = (backoff.as_millis() / 4) as u64;
        if spread == 0 {
            return backoff;
        }
        let jitter = rand::thread_rng().gen_range(0..=spread);
        (backoff + Duration::from_millis(jitter)).min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the attempt cap is hit.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let outcome = match timeout(policy.attempt_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(E::timed_out(policy.attempt_timeout)),
        };

        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    debug!("'{}' succeeded on attempt {}", operation, attempt);
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.jittered_backoff_for(attempt);
                warn!(
                    "'{}' failed (attempt {}/{}): {}. Backing off for {:?}",
                    operation, attempt, max_attempts, e, delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(
                    "'{}' giving up after attempt {}/{}: {}",
                    operation, attempt, max_attempts, e
                );
                return Err(e);
            }
        }
    }
}
