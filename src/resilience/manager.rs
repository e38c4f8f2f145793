//! Composition of the resilience primitives for arbitrary dependencies.
//!
//! One `Resilience` is built at startup and shared by `Arc`. Callers name the
//! dependency they are calling (an LLM API, an RPC node, a webhook host) and
//! get retry → breaker → bounded execution around their work.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{RelayConfig, RetryConfig};
use crate::resilience::circuit_breaker::BreakerRegistry;
use crate::resilience::deadline::Deadline;
use crate::resilience::error::ResilienceError;
use crate::resilience::retries::{self, RetryPolicy};
use crate::resilience::timeouts::{RunOptions, TimeoutManager};

/// Per-call limits for [`Resilience::call`].
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Prefix for the ids of each attempt; generated when absent.
    pub operation_id: Option<String>,
    /// Limit on each attempt.
    pub timeout: Option<Duration>,
    /// Budget for the whole call including retries and backoff.
    pub deadline: Option<Deadline>,
}

impl CallOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn within(deadline: Deadline) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::default()
        }
    }

    pub fn with_operation_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Shared timeout manager, breakers and retry defaults.
#[derive(Debug)]
pub struct Resilience {
    timeouts: TimeoutManager,
    breakers: BreakerRegistry,
    retry: RetryConfig,
}

impl Resilience {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            timeouts: TimeoutManager::new(&config.timeouts),
            breakers: BreakerRegistry::with_tracing(config.circuit_breaker.clone()),
            retry: config.retries.clone(),
        }
    }

    pub fn timeouts(&self) -> &TimeoutManager {
        &self.timeouts
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Retry policy built from the configured defaults.
    pub fn default_policy<E>(&self) -> RetryPolicy<E> {
        RetryPolicy::from_config(&self.retry)
    }

    /// Call `dependency` with `op`, retrying per `policy`.
    ///
    /// Each attempt goes through the dependency's breaker and runs under the
    /// timeout manager; an open breaker or a spent deadline ends the call.
    pub async fn call<T, E, F, Fut>(
        &self,
        dependency: &str,
        policy: &RetryPolicy<E>,
        options: CallOptions,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.breakers.get(dependency);
        let call_id = options
            .operation_id
            .unwrap_or_else(|| format!("{dependency}-{}", Uuid::new_v4()));
        let op = &op;

        retries::run(policy, options.deadline, |attempt| {
            let breaker = breaker.clone();
            let run_options = RunOptions {
                operation_id: Some(format!("{call_id}#{attempt}")),
                parent_id: Some(call_id.clone()),
                timeout: options.timeout,
                deadline: options.deadline,
            };
            async move {
                breaker
                    .execute(|| self.timeouts.run(run_options, |token| op(token)))
                    .await
            }
        })
        .await
    }
}
