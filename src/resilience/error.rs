//! Error taxonomy shared by every resilience primitive.
//!
//! # Design Decisions
//! - Each failure kind is its own type so callers match on kind, never on message text
//! - `ResilienceError<E>` carries the wrapped work's error untouched in `Inner`
//! - Only `Timeout` and `Inner` are eligible for retry

use std::time::Duration;
use thiserror::Error;

/// The remaining budget of a [`Deadline`](super::deadline::Deadline) ran out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("deadline exceeded{}", during(.operation_id))]
pub struct DeadlineExceeded {
    /// Operation that was running (or about to start) when the budget ran out.
    pub operation_id: Option<String>,
}

fn during(operation_id: &Option<String>) -> String {
    operation_id
        .as_ref()
        .map(|id| format!(" during {id}"))
        .unwrap_or_default()
}

/// A single operation outlived its own timeout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("operation {operation_id} timed out after {}ms (limit {}ms)", .elapsed.as_millis(), .timeout.as_millis())]
pub struct TimeoutError {
    pub operation_id: String,
    pub timeout: Duration,
    pub elapsed: Duration,
}

/// The breaker guarding a dependency is open; the work was not invoked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit '{breaker}' is open, next probe in {}ms", .retry_after.as_millis())]
pub struct CircuitOpenError {
    pub breaker: String,
    pub retry_after: Duration,
}

/// Errors surfaced by the resilience layer around a unit of work failing with `E`.
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    #[error(transparent)]
    DeadlineExceeded(#[from] DeadlineExceeded),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// The operation was cancelled through the timeout manager.
    #[error("operation {operation_id} was cancelled")]
    Cancelled { operation_id: String },

    /// The unit of work itself failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> ResilienceError<E> {
    /// Whether a retry could plausibly change the outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Inner(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded(_))
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Borrow the wrapped work error, if this is one.
    pub fn inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Map the wrapped work error, keeping every resilience kind as is.
    pub fn map_inner<F, U>(self, f: F) -> ResilienceError<U>
    where
        F: FnOnce(E) -> U,
    {
        match self {
            Self::DeadlineExceeded(e) => ResilienceError::DeadlineExceeded(e),
            Self::Timeout(e) => ResilienceError::Timeout(e),
            Self::CircuitOpen(e) => ResilienceError::CircuitOpen(e),
            Self::Cancelled { operation_id } => ResilienceError::Cancelled { operation_id },
            Self::Inner(e) => ResilienceError::Inner(f(e)),
        }
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeadlineExceeded(_) => "deadline_exceeded",
            Self::Timeout(_) => "timeout",
            Self::CircuitOpen(_) => "circuit_open",
            Self::Cancelled { .. } => "cancelled",
            Self::Inner(_) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err: ResilienceError<std::io::Error> = TimeoutError {
            operation_id: "llm-call".to_string(),
            timeout: Duration::from_millis(50),
            elapsed: Duration::from_millis(51),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "operation llm-call timed out after 51ms (limit 50ms)"
        );

        let err = DeadlineExceeded {
            operation_id: Some("rpc".to_string()),
        };
        assert_eq!(err.to_string(), "deadline exceeded during rpc");
        assert_eq!(
            DeadlineExceeded { operation_id: None }.to_string(),
            "deadline exceeded"
        );
    }

    #[test]
    fn test_retryable_kinds() {
        let inner: ResilienceError<&str> = ResilienceError::Inner("boom");
        assert!(inner.is_retryable());
        assert_eq!(inner.inner(), Some(&"boom"));

        let open: ResilienceError<&str> = CircuitOpenError {
            breaker: "api".to_string(),
            retry_after: Duration::from_secs(1),
        }
        .into();
        assert!(!open.is_retryable());
        assert!(open.is_circuit_open());

        let expired: ResilienceError<&str> = DeadlineExceeded { operation_id: None }.into();
        assert!(!expired.is_retryable());

        let cancelled: ResilienceError<&str> = ResilienceError::Cancelled {
            operation_id: "x".to_string(),
        };
        assert!(!cancelled.is_retryable());
    }

    #[test]
    fn test_map_inner_keeps_kind() {
        let err: ResilienceError<u16> = ResilienceError::Inner(503);
        let mapped = err.map_inner(|code| format!("status {code}"));
        assert_eq!(mapped.into_inner().as_deref(), Some("status 503"));
    }
}
