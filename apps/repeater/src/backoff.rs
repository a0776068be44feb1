//! Retry wrapper shared by every unreliable outbound operation.
//!
//! Transient failures are retried after `max(2^depth * 100ms, 1s)`; fatal
//! failures, or a failure at `max_depth`, end the call with the last error.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{human_message, WithErrorCode};

const BASE_DELAY_MS: u64 = 100;
const MIN_DELAY_MS: u64 = 1_000;

/// Delay applied before retrying the attempt made at `depth`.
pub fn delay_for(depth: u32) -> Duration {
    let millis = 2u64
        .saturating_pow(depth)
        .saturating_mul(BASE_DELAY_MS)
        .max(MIN_DELAY_MS);
    Duration::from_millis(millis)
}

pub struct Backoff<E> {
    max_depth: u32,
    is_fatal: Box<dyn Fn(&E) -> bool + Send + Sync>,
    label: &'static str,
}

impl<E> Backoff<E>
where
    E: StdError + WithErrorCode,
{
    pub fn new<F>(max_depth: u32, is_fatal: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self {
            max_depth,
            is_fatal: Box::new(is_fatal),
            label: "operation",
        }
    }

    /// Name used in retry logs.
    pub fn with_label(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }

    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, BackoffError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut depth = 0u32;
        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if (self.is_fatal)(&err) {
                debug!(
                    target: "repeater::backoff",
                    operation = self.label,
                    error = %err,
                    "fatal failure, not retrying"
                );
                return Err(BackoffError::Fatal(err));
            }
            if depth >= self.max_depth {
                return Err(BackoffError::Exhausted {
                    attempts: depth + 1,
                    source: err,
                });
            }

            let delay = delay_for(depth);
            warn!(
                target: "repeater::backoff",
                operation = self.label,
                attempt = depth + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            depth += 1;
        }
    }
}

#[derive(Debug)]
pub enum BackoffError<E> {
    /// The classifier marked the failure as non-retryable.
    Fatal(E),
    /// Every allowed attempt failed; `source` is the last failure.
    Exhausted { attempts: u32, source: E },
}

impl<E> BackoffError<E> {
    pub fn inner(&self) -> &E {
        match self {
            BackoffError::Fatal(err) => err,
            BackoffError::Exhausted { source, .. } => source,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, BackoffError::Fatal(_))
    }

    /// Number of times the operation ran.
    pub fn attempts(&self) -> u32 {
        match self {
            BackoffError::Fatal(_) => 1,
            BackoffError::Exhausted { attempts, .. } => *attempts,
        }
    }
}

impl<E> BackoffError<E>
where
    E: StdError + WithErrorCode,
{
    pub fn message(&self) -> String {
        human_message(self.inner())
    }
}

impl<E> fmt::Display for BackoffError<E>
where
    E: StdError + WithErrorCode,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

impl<E> StdError for BackoffError<E>
where
    E: StdError + WithErrorCode + 'static,
{
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.inner())
    }
}
