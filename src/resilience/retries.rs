//! Retry logic.
//!
//! # Responsibilities
//! - Decide whether a failed attempt is worth repeating
//! - Execute retries with exponential backoff + jitter
//! - Never sleep past the caller's deadline
//!
//! # Design Decisions
//! - Open circuits, exhausted deadlines and cancellations are never retried
//! - Intermediate failures are swallowed here and only here; the last error is
//!   returned exactly as the final attempt produced it
//! - Policies are plain values built from `RetryConfig` defaults and tweaked per call site

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::observability::metrics;
use crate::resilience::backoff::{apply_jitter, exponential_delay};
use crate::resilience::deadline::Deadline;
use crate::resilience::error::{DeadlineExceeded, ResilienceError};

type RetryPredicate<E> = Arc<dyn Fn(&ResilienceError<E>, u32) -> bool + Send + Sync>;

/// How many times and how patiently to retry a unit of work failing with `E`.
pub struct RetryPolicy<E> {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
    should_retry: Option<RetryPredicate<E>>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            backoff_factor: self.backoff_factor,
            jitter: self.jitter,
            should_retry: self.should_retry.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("jitter", &self.jitter)
            .field("should_retry", &self.should_retry.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

impl<E> Default for RetryPolicy<E> {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl<E> RetryPolicy<E> {
    /// Policy with the configured defaults and no predicate.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_factor: config.backoff_factor,
            jitter: config.jitter,
            should_retry: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Only retry when `predicate(error, attempt)` returns true.
    pub fn with_should_retry<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ResilienceError<E>, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Un-jittered delay after attempt `attempt` (0-indexed).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        exponential_delay(attempt, self.initial_delay, self.backoff_factor, self.max_delay)
    }

    /// Delay after attempt `attempt`, jittered when the policy asks for it.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter {
            apply_jitter(delay)
        } else {
            delay
        }
    }

    /// How long to wait before the next attempt, or `None` if `error` from
    /// attempt `attempt` (0-indexed) must be returned to the caller.
    pub fn next_delay(&self, attempt: u32, error: &ResilienceError<E>) -> Option<Duration> {
        if !error.is_retryable() || attempt + 1 >= self.max_attempts {
            return None;
        }
        if let Some(should_retry) = &self.should_retry {
            if !should_retry(error, attempt) {
                return None;
            }
        }
        Some(self.calculate_delay(attempt))
    }

    /// Bind this policy to a unit of work, producing a callable that retries it.
    pub fn wrap<F>(self, op: F) -> Retrying<E, F> {
        Retrying { policy: self, op }
    }
}

/// Run `op` under `policy`, bounded by `deadline` when one is given.
///
/// `op` receives the 0-indexed attempt number. The error returned is the one
/// produced by the last attempt that ran.
pub async fn run<T, E, F, Fut>(
    policy: &RetryPolicy<E>,
    deadline: Option<Deadline>,
    mut op: F,
) -> Result<T, ResilienceError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ResilienceError<E>>>,
{
    if let Some(deadline) = deadline {
        deadline.check()?;
    }

    let mut attempt = 0;
    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let Some(mut delay) = policy.next_delay(attempt, &error) else {
            if attempt > 0 {
                tracing::debug!(attempts = attempt + 1, kind = error.kind(), "Giving up after retries");
            }
            return Err(error);
        };

        if let Some(deadline) = deadline {
            let remaining = deadline.remaining();
            if remaining.is_zero() {
                tracing::debug!(attempt, "Deadline spent, not retrying");
                return Err(error);
            }
            delay = delay.min(remaining);
        }

        tracing::info!(attempt, delay = ?delay, kind = error.kind(), "Retrying operation");
        metrics::record_retry_attempt();
        tokio::time::sleep(delay).await;
        if deadline.is_some_and(|d| d.is_expired()) {
            tracing::debug!(attempt, "Deadline spent during backoff, not retrying");
            return Err(error);
        }
        attempt += 1;
    }
}

/// A unit of work with its retry policy attached.
pub struct Retrying<E, F> {
    policy: RetryPolicy<E>,
    op: F,
}

impl<E, F> Retrying<E, F> {
    pub fn policy(&self) -> &RetryPolicy<E> {
        &self.policy
    }

    /// Invoke the wrapped work with retries.
    pub async fn call<T, Fut>(&self) -> Result<T, ResilienceError<E>>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        run(&self.policy, None, |attempt| (self.op)(attempt)).await
    }

    /// Invoke the wrapped work with retries, bounded by `deadline`.
    pub async fn call_within<T, Fut>(&self, deadline: Deadline) -> Result<T, ResilienceError<E>>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        run(&self.policy, Some(deadline), |attempt| (self.op)(attempt)).await
    }
}

/// Shorthand for an already-expired deadline error.
pub(crate) fn deadline_spent<E>(operation_id: &str) -> ResilienceError<E> {
    DeadlineExceeded {
        operation_id: Some(operation_id.to_string()),
    }
    .into()
}
