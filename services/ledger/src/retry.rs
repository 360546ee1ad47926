//! Retry with exponential backoff for transient storage faults
//!
//! The delay before retry `n` (0-indexed) is
//! `min(initial_delay × multiplier^n, max_delay)`, shortened by up to
//! `jitter_factor` so concurrent connectors do not retry in lockstep.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;
use types::errors::{IngestError, StorageError};

/// Errors that know whether another attempt may succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        StorageError::is_retryable(self)
    }
}

impl Retryable for IngestError {
    fn is_retryable(&self) -> bool {
        IngestError::is_retryable(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = fail fast)
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// 0.0..=1.0
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        initial_delay_ms: u64,
        max_delay_ms: u64,
        backoff_multiplier: f64,
        jitter_factor: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
            max_delay_ms,
            backoff_multiplier,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry `attempt` (0-indexed), without jitter.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(base.min(self.max_delay_ms as f64) as u64)
    }

    pub fn calculate_delay_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.calculate_delay(attempt);
        if self.jitter_factor <= 0.0 {
            return base;
        }
        let jitter: f64 = rand::rng().random();
        let jittered = base.as_millis() as f64 * (1.0 - self.jitter_factor * jitter);
        Duration::from_millis(jittered.max(1.0) as u64)
    }

    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made <= self.max_retries
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { last_error: E, attempts: u32 },

    #[error("not retryable (attempt {attempts}): {error}")]
    NonRetryable { error: E, attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last_error, .. } => last_error,
            Self::NonRetryable { error, .. } => error,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::NonRetryable { attempts, .. } => *attempts,
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or the policy
/// runs out of retries.
pub async fn execute_with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempts = 0u32;

    loop {
        attempts = attempts.saturating_add(1);

        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if !error.is_retryable() => {
                return Err(RetryError::NonRetryable { error, attempts });
            }
            Err(error) => {
                if !policy.should_retry(attempts) {
                    return Err(RetryError::Exhausted {
                        last_error: error,
                        attempts,
                    });
                }
                let delay = policy.calculate_delay_with_jitter(attempts - 1);
                warn!(
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient failure, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}
