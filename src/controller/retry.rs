//! # Retry Controller
//!
//! Wraps destination calls with classification-aware retries.
//!
//! - `ClientSide` failures are returned after the first attempt
//! - `ExternalService` failures are retried up to `max_external_attempts`
//! - `Internal` failures are retried up to `max_internal_attempts`
//!
//! Attempts are counted on the [`SyncOperation`]. Between attempts the
//! caller's `on_retry` hook runs (the executor re-stamps `PENDING` there) and
//! the controller sleeps for the next [`ExponentialBackoff`] delay. A shutdown
//! signal interrupts the sleep and the call returns [`RetryError::Cancelled`].

use crate::constants::{
    DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_CAP_MS, DEFAULT_BACKOFF_JITTER_RATIO,
    DEFAULT_MAX_EXTERNAL_ATTEMPTS, DEFAULT_MAX_INTERNAL_ATTEMPTS,
};
use crate::controller::backoff::ExponentialBackoff;
use crate::error::{DestinationError, FailureClass};
use crate::model::SyncOperation;
use crate::observability::metrics;
use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Retry limits and backoff shape
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter_ratio: f64,
    /// Attempts for `ExternalService` failures, first call included
    pub max_external_attempts: u32,
    /// Attempts for `Internal` failures, first call included
    pub max_internal_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            cap: Duration::from_millis(DEFAULT_BACKOFF_CAP_MS),
            jitter_ratio: DEFAULT_BACKOFF_JITTER_RATIO,
            max_external_attempts: DEFAULT_MAX_EXTERNAL_ATTEMPTS,
            max_internal_attempts: DEFAULT_MAX_INTERNAL_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Total attempts allowed once a failure of `class` has been seen
    #[must_use]
    pub fn max_attempts(&self, class: FailureClass) -> u32 {
        match class {
            FailureClass::ClientSide => 1,
            FailureClass::ExternalService => self.max_external_attempts.max(1),
            FailureClass::Internal => self.max_internal_attempts.max(1),
        }
    }

    #[must_use]
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.base, self.cap, self.jitter_ratio)
    }
}

/// Outcome of a call that did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryError {
    /// Non-retryable failure, or the retry budget ran out
    #[error("{0}")]
    Failed(DestinationError),
    /// Shutdown interrupted a backoff sleep
    #[error("retry cancelled by shutdown")]
    Cancelled,
}

/// Runs destination calls under a [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl RetryController {
    #[must_use]
    pub fn new(policy: RetryPolicy, shutdown: watch::Receiver<bool>) -> Self {
        Self { policy, shutdown }
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `call` until it succeeds, fails permanently, or shutdown interrupts a sleep
    ///
    /// `on_retry` runs before each backoff sleep with the operation's updated
    /// attempt count and `next_retry_at`.
    pub async fn run<T, F, Fut, R>(
        &self,
        operation: &mut SyncOperation,
        mut call: F,
        mut on_retry: R,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DestinationError>>,
        R: FnMut(&SyncOperation),
    {
        let mut backoff = self.policy.backoff();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            operation.attempt_count += 1;

            let err = match call().await {
                Ok(value) => {
                    operation.next_retry_at = None;
                    return Ok(value);
                }
                Err(err) => err,
            };

            let limit = self.policy.max_attempts(err.class);
            if attempts >= limit {
                if err.is_retryable() {
                    warn!(
                        association = %operation.key,
                        operation = operation.kind.as_str(),
                        attempt = attempts,
                        error.class = err.class.as_str(),
                        error.code = %err.code,
                        "Retry budget exhausted: {}",
                        err.message
                    );
                } else {
                    debug!(
                        association = %operation.key,
                        error.code = %err.code,
                        "Non-retryable destination failure"
                    );
                }
                operation.next_retry_at = None;
                return Err(RetryError::Failed(err));
            }

            let delay = backoff.next_backoff();
            operation.next_retry_at = chrono::Duration::from_std(delay)
                .ok()
                .map(|delay| Utc::now() + delay);
            metrics::increment_retries(err.class.as_str());
            warn!(
                association = %operation.key,
                operation = operation.kind.as_str(),
                attempt = attempts,
                error.class = err.class.as_str(),
                error.code = %err.code,
                "Destination call failed, retrying in {:?}",
                delay
            );
            on_retry(operation);

            if !self.sleep(delay).await {
                debug!(association = %operation.key, "Retry cancelled by shutdown");
                return Err(RetryError::Cancelled);
            }
        }
    }

    /// Sleep for `delay`; `false` when shutdown was signalled first
    async fn sleep(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            Ok(_) = shutdown.wait_for(|stopping| *stopping) => false,
        }
    }
}
