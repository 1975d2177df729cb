//! Retry wrapper with a fixed backoff.
//!
//! The delivery path runs with no attempt limit and retries whatever the
//! transport returns: a publish issued during an outage keeps its task busy
//! until the transport accepts it or the executor is interrupted by shutdown.

use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{DeliveryError, DeliveryResult},
    metrics,
};

/// Backoff used by the publish path unless configured otherwise.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

/// Attempt limit, delay between attempts and which failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, `None` for unbounded.
    pub max_attempts: Option<u32>,
    /// Fixed delay between a failed attempt and the next one.
    pub backoff: Duration,
    /// Retry every error, not only those where
    /// [`DeliveryError::is_retryable`] holds.
    pub retry_all: bool,
}

impl RetryPolicy {
    /// Retry every failure forever with a fixed delay. Only an interrupt ends
    /// the loop without success.
    pub fn always(backoff: Duration) -> Self {
        Self {
            max_attempts: None,
            backoff,
            retry_all: true,
        }
    }

    /// Retry transient failures forever with a fixed delay.
    pub fn unbounded(backoff: Duration) -> Self {
        Self {
            max_attempts: None,
            backoff,
            retry_all: false,
        }
    }

    /// Retry transient failures, giving up after `max_attempts` attempts.
    pub fn bounded(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            backoff,
            retry_all: false,
        }
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }

    fn gives_up_on(&self, err: &DeliveryError) -> bool {
        err.is_interrupted() || !(self.retry_all || err.is_retryable())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::always(DEFAULT_BACKOFF)
    }
}

/// Runs operations under a [`RetryPolicy`] until they succeed, fail with an
/// error the policy does not retry, exhaust the policy, or the executor is
/// interrupted.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    token: CancellationToken,
}

impl RetryExecutor {
    /// Create an executor interrupted by `token`.
    pub fn new(policy: RetryPolicy, token: CancellationToken) -> Self {
        Self { policy, token }
    }

    /// Returns the retry policy.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Abort every loop running on this executor (and its clones).
    pub fn interrupt(&self) {
        self.token.cancel();
    }

    /// True once [`interrupt`](Self::interrupt) was called or the parent token
    /// was cancelled.
    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run `operation` until it succeeds.
    ///
    /// Unless the policy retries every error, errors for which
    /// [`DeliveryError::is_retryable`] is false are returned immediately. An
    /// interrupt aborts both a pending attempt and the backoff sleep.
    pub async fn run<T, F, Fut>(&self, name: &str, mut operation: F) -> DeliveryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DeliveryResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if self.token.is_cancelled() {
                return Err(self.interrupted(name, attempt));
            }
            attempt = attempt.saturating_add(1);
            let result = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    return Err(self.interrupted(name, attempt));
                }
                res = operation() => res,
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation = name, attempts = attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if self.policy.gives_up_on(&err) => {
                    debug!(operation = name, attempt, error = %err, "non-retryable failure");
                    return Err(err);
                }
                Err(err) if self.policy.exhausted(attempt) => {
                    warn!(operation = name, attempts = attempt, error = %err, "retry attempts exhausted");
                    return Err(err);
                }
                Err(err) => {
                    metrics::RETRY_ATTEMPTS.inc();
                    warn!(
                        operation = name,
                        attempt,
                        retry_in_ms = self.policy.backoff.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = self.token.cancelled() => {
                            return Err(self.interrupted(name, attempt));
                        }
                        _ = tokio::time::sleep(self.policy.backoff) => {}
                    }
                }
            }
        }
    }

    fn interrupted(&self, name: &str, attempt: u32) -> DeliveryError {
        warn!(operation = name, attempt, "retry loop interrupted");
        DeliveryError::Interrupted(format!("{name} interrupted after {attempt} attempt(s)"))
    }
}
