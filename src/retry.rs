//! Retry policy shared by session login and order submission
//!
//! Attempts are bounded by count, not elapsed time. Each operation decides
//! which of its errors are worth another attempt through [`Retryable`].

use backoff::{future::retry, ExponentialBackoff};
use serde::Deserialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::BrokerError;

/// Classifies errors as transient or permanent
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for BrokerError {
    fn is_retryable(&self) -> bool {
        BrokerError::is_retryable(self)
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Randomization factor applied to each delay (0.0 = none)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff_ms() -> u64 { 200 }
fn default_max_backoff_ms() -> u64 { 2_000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_jitter() -> f64 { 0.2 }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// Final failure of a retried operation
#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure<E> {
    pub error: E,
    /// Attempts actually made
    pub attempts: u32,
    /// True when the last error was retryable and attempts ran out
    pub exhausted: bool,
}

impl RetryPolicy {
    /// Policy with no delay between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    fn attempts_allowed(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Backoff schedule for one retried operation
    pub fn backoff(&self) -> ExponentialBackoff {
        let initial = Duration::from_millis(self.initial_backoff_ms);
        ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            max_interval: Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms)),
            multiplier: self.multiplier,
            randomization_factor: self.jitter,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, RetryFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let max_attempts = self.attempts_allowed();
        let attempts = AtomicU32::new(0);

        let result = retry(self.backoff(), || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let fut = op(attempt);
            async move {
                match fut.await {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_retryable() && attempt < max_attempts => {
                        warn!(
                            operation,
                            attempt,
                            max_attempts,
                            error = %e,
                            "Retryable failure, backing off"
                        );
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => {
                        debug!(operation, attempt, error = %e, "Giving up");
                        Err(backoff::Error::permanent(e))
                    }
                }
            }
        })
        .await;

        result.map_err(|error| RetryFailure {
            exhausted: error.is_retryable(),
            attempts: attempts.load(Ordering::SeqCst),
            error,
        })
    }
}
