use crate::types::{ObservedError, Result};
use std::future::Future;
use std::time::Duration;

/// How long to wait before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base_ms + step_ms * attempt`
    Linear { base_ms: u64, step_ms: u64 },
    /// `base_ms * 2^(attempt-1)` with ±25% jitter.
    Exponential { base_ms: u64 },
}

impl Backoff {
    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Linear { base_ms, step_ms } => {
                Duration::from_millis(base_ms + step_ms * attempt as u64)
            }
            Backoff::Exponential { base_ms } => {
                let base_delay = base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
                // Add jitter: ±25% of the base delay
                let jitter_range = base_delay / 4;
                let jitter = if jitter_range > 0 {
                    fastrand::i64(-(jitter_range as i64)..jitter_range as i64)
                } else {
                    0
                };
                Duration::from_millis((base_delay as i64 + jitter).max(1) as u64)
            }
        }
    }
}

/// Bounded retry combinator shared by variant allocation and variant fetches.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn linear(max_attempts: u32, base_ms: u64, step_ms: u64) -> Self {
        Self::new(max_attempts, Backoff::Linear { base_ms, step_ms })
    }

    pub fn exponential(max_attempts: u32, base_ms: u64) -> Self {
        Self::new(max_attempts, Backoff::Exponential { base_ms })
    }

    /// Retries transient store and transport failures.
    pub async fn execute_with_retry<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_when(operation, |e| e.inner.is_transient()).await
    }

    /// Runs `operation` until it succeeds, `should_retry` rejects the error, or
    /// attempts run out. The last error is returned unchanged.
    pub async fn execute_when<F, Fut, T, P>(&self, mut operation: F, should_retry: P) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&ObservedError) -> bool,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(val) => return Ok(val),
                Err(e) if attempt < self.max_attempts && should_retry(&e) => {
                    let delay = self.backoff.delay_for(attempt);
                    tracing::debug!(
                        "Attempt {} failed: {}. Retrying in {:?}...",
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
