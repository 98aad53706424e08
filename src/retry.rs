// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded retry with backoff
//!
//! Wraps any fallible async unit of work (a dial, a whole session, a single
//! command) and re-runs it while the error is retryable and the attempt
//! budget lasts. Each retry is announced through a notification callback
//! before the backoff sleep.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{FlockError, Result};

/// How the delay grows between successive attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed,
    /// base, 2*base, 3*base, ...
    Linear,
    /// base, 2*base, 4*base, ...
    #[default]
    Exponential,
}

/// Attempt budget and backoff shape
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        strategy: BackoffStrategy,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strategy,
            base_delay,
            max_delay,
        }
    }

    /// Delay before the given retry (0 is the first retry), capped at `max_delay`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let millis = match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base.saturating_mul(retry as u64 + 1),
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(retry)),
        };
        Duration::from_millis(millis).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    /// 3 attempts, exponential backoff from 500ms, capped at one minute.
    fn default() -> Self {
        Self::new(
            3,
            BackoffStrategy::Exponential,
            Duration::from_millis(500),
            Duration::from_secs(60),
        )
    }
}

/// Run `operation` until it succeeds, fails terminally, or the budget is spent.
///
/// `operation` receives the 1-based attempt number. `notify` is called with
/// the error, the upcoming delay, and the attempt that just failed, once per
/// retry. Cancellation aborts both an in-flight attempt and a backoff sleep.
pub async fn retry_notify<T, F, Fut, N>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
    mut notify: N,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    N: FnMut(&FlockError, Duration, u32),
{
    let mut attempt = 1;
    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FlockError::Cancelled),
            outcome = operation(attempt) => outcome,
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() || attempt >= policy.max_attempts {
            return Err(err);
        }

        let delay = policy.delay_for(attempt - 1);
        notify(&err, delay, attempt);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FlockError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
