//! Retry loop for deliveries to a single target.
//!
//! - Up to `max_retries` total attempts on the chosen target
//! - Fixed `retry_wait_time` between attempts
//! - Failed attempts are pushed into a caller-owned
//!   `Arc<Mutex<Vec<AttemptRecord>>>` so they survive cancellation
//! - Header formatting for `x-switchyard-retries`

use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::TargetConfig;
use crate::router::ErrorClass;

/// Record of a single failed attempt for building the `x-switchyard-retries` header.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub target: String,
    pub class: ErrorClass,
}

/// Classifies an attempt error so the loop can decide whether to retry.
pub trait Classify {
    fn error_class(&self) -> ErrorClass;
}

/// Attempt budget and spacing for one target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub wait: Duration,
}

impl RetryPolicy {
    pub fn for_target(target: &TargetConfig) -> Self {
        Self {
            max_attempts: target.max_retries.max(1),
            wait: target.retry_wait_time,
        }
    }
}

/// Why the retry loop gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The error class is not worth another attempt.
    NonRetryable(E),
    /// Every attempt failed with a retryable error; holds the last one.
    Exhausted { error: E, attempts: u32 },
    /// The cancellation token fired.
    Cancelled,
}

/// Format attempt records into the `x-switchyard-retries` header value.
///
/// Format: `"2/alpha, 1/beta"`, the count of failed attempts per target in
/// order of first appearance. Returns `None` when nothing failed.
pub fn format_retries_header(attempts: &[AttemptRecord]) -> Option<String> {
    if attempts.is_empty() {
        return None;
    }
    let mut counts: Vec<(&str, u32)> = Vec::new();
    for attempt in attempts {
        match counts.iter_mut().find(|(name, _)| *name == attempt.target) {
            Some(entry) => entry.1 += 1,
            None => counts.push((&attempt.target, 1)),
        }
    }
    Some(
        counts
            .iter()
            .map(|(name, count)| format!("{}/{}", count, name))
            .collect::<Vec<_>>()
            .join(", "),
    )
}

/// Run `send` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent.
///
/// `send` receives the 1-based attempt number. Both the attempt itself and
/// the wait between attempts are raced against `cancel`.
pub async fn retry_with_backoff<T, E, F, Fut>(
    target: &str,
    policy: RetryPolicy,
    attempts: Arc<Mutex<Vec<AttemptRecord>>>,
    cancel: &CancellationToken,
    mut send: F,
) -> Result<T, RetryError<E>>
where
    E: Classify + Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = send(attempt) => result,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let class = error.error_class();
        attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(AttemptRecord {
                target: target.to_string(),
                class,
            });

        if !class.is_retryable() {
            tracing::warn!(target_id = %target, attempt, class = %class, error = %error, "Non-retryable failure");
            return Err(RetryError::NonRetryable(error));
        }

        if attempt >= max_attempts {
            tracing::warn!(target_id = %target, attempts = attempt, class = %class, error = %error, "Retries exhausted");
            return Err(RetryError::Exhausted {
                error,
                attempts: attempt,
            });
        }

        tracing::warn!(
            target_id = %target,
            attempt,
            max_attempts,
            class = %class,
            error = %error,
            wait_ms = policy.wait.as_millis() as u64,
            "Attempt failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(policy.wait) => {}
        }
        attempt += 1;
    }
}
