//! Bounded retry state machine
//!
//! Retry loops are driven explicitly: a `RetryState` holds the attempt
//! counter, the last error and the backoff schedule, so both the bound and
//! the degraded fallback stay visible at each call site.

use crate::errors::{AppError, Result};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry budget for one backend operation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline applied to every single attempt
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff_ms: u64, max_backoff_ms: u64, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::from_millis(initial_backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms.max(initial_backoff_ms)),
            attempt_timeout,
        }
    }

    /// Policy without pauses between attempts
    pub fn immediate(max_attempts: u32, attempt_timeout: Duration) -> Self {
        Self::new(max_attempts, 0, 0, attempt_timeout)
    }

    /// Start a fresh state machine for one operation
    pub fn start(&self, service: &str) -> RetryState {
        RetryState::new(self, service)
    }

    /// Run `op` until it succeeds, a non-retryable error occurs, or the budget is spent.
    ///
    /// Each attempt is bounded by `attempt_timeout`; a timeout counts as a failed attempt.
    pub async fn run<T, F, Fut>(&self, service: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = self.start(service);
        while let Some(attempt) = state.next_attempt().await {
            match with_timeout(self.attempt_timeout, service, op(attempt)).await {
                Ok(value) => return Ok(value),
                Err(e) => state.record_failure(e),
            }
        }
        Err(state.into_error())
    }
}

/// Attempt counter, last error and backoff schedule for one operation
#[derive(Debug)]
pub struct RetryState {
    service: String,
    max_attempts: u32,
    attempt: u32,
    halted: bool,
    last_error: Option<AppError>,
    backoff: ExponentialBackoff,
}

impl RetryState {
    fn new(policy: &RetryPolicy, service: &str) -> Self {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(policy.initial_backoff)
            .with_max_interval(policy.max_backoff)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build();

        Self {
            service: service.to_string(),
            max_attempts: policy.max_attempts,
            attempt: 0,
            halted: false,
            last_error: None,
            backoff,
        }
    }

    /// Advance to the next attempt, sleeping the backoff first when this is a retry.
    ///
    /// Returns the 1-based attempt number, or `None` once the machine is terminal.
    pub async fn next_attempt(&mut self) -> Option<u32> {
        if self.halted || self.attempt >= self.max_attempts {
            return None;
        }
        if self.attempt > 0 {
            let delay = self.backoff.next_backoff().unwrap_or(self.backoff.max_interval);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        self.attempt += 1;
        Some(self.attempt)
    }

    /// Record a failed attempt; non-retryable errors end the loop immediately
    pub fn record_failure(&mut self, err: AppError) {
        if err.is_retryable() {
            warn!(
                service = %self.service,
                attempt = self.attempt,
                max_attempts = self.max_attempts,
                error = %err,
                "Attempt failed"
            );
        } else {
            self.halted = true;
        }
        self.last_error = Some(err);
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn last_error(&self) -> Option<&AppError> {
        self.last_error.as_ref()
    }

    /// Whether the last failure stopped the loop before the budget was spent
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Terminal error for callers that propagate instead of degrading.
    ///
    /// Non-retryable errors surface unchanged; exhausted transient failures
    /// collapse into `BackendUnavailable` so backend details do not leak.
    pub fn into_error(self) -> AppError {
        match self.last_error {
            Some(err) if !err.is_retryable() => err,
            _ => AppError::BackendUnavailable {
                service: self.service,
                attempts: self.attempt,
            },
        }
    }
}

/// Bound a single backend call by `duration`
pub async fn with_timeout<T, Fut>(duration: Duration, service: &str, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::BackendTimeout {
            service: service.to_string(),
            timeout_ms: duration.as_millis() as u64,
        }),
    }
}
