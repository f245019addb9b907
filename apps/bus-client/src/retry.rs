//! Fixed-delay retry with optional attempt cap and cancellation.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{BusError, Result};

#[derive(Clone)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    cancel: CancellationToken,
}

impl RetryPolicy {
    /// Retry forever, waiting `delay` between attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs out
    /// of attempts or the policy is cancelled.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(BusError::cancelled());
            }
            attempt += 1;
            tracing::info!(attempt, what, "attempting");
            let err = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(attempt, what, "succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            if self.max_attempts.is_some_and(|max| attempt >= max) {
                tracing::warn!(attempt, what, %err, "giving up");
                return Err(err);
            }
            tracing::warn!(
                attempt,
                what,
                %err,
                retry_in_ms = self.delay.as_millis() as u64,
                "attempt failed"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = self.cancel.cancelled() => return Err(BusError::cancelled()),
            }
        }
    }
}
