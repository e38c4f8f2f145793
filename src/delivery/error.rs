//! Delivery and subscription errors.

use thiserror::Error;

use crate::resilience::ResilienceError;

/// Failure of a single delivery attempt.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("endpoint answered {status}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl DeliveryError {
    /// Whether another attempt could succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, DeliveryError::Serialize(_))
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            DeliveryError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// The `last_status` string recorded for a failed delivery.
pub fn status_label(error: &ResilienceError<DeliveryError>) -> String {
    match error {
        ResilienceError::Inner(DeliveryError::Status { status, .. }) => format!("error_{status}"),
        ResilienceError::Inner(DeliveryError::Transport(_)) => "error_network".to_string(),
        ResilienceError::Inner(DeliveryError::Serialize(_)) => "error_payload".to_string(),
        ResilienceError::Timeout(_) | ResilienceError::DeadlineExceeded(_) => "error_timeout".to_string(),
        ResilienceError::CircuitOpen(_) => "error_circuit_open".to_string(),
        ResilienceError::Cancelled { .. } => "error_cancelled".to_string(),
    }
}

/// Subscription registry failures.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("subscription {0} not found")]
    NotFound(String),

    #[error("subscription {0} already exists")]
    Duplicate(String),

    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("at least one event type is required")]
    NoEvents,

    #[error("persistence failed: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("corrupt subscriptions file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitOpenError, TimeoutError};
    use std::time::Duration;

    #[test]
    fn test_status_labels() {
        let status = ResilienceError::Inner(DeliveryError::Status {
            status: 503,
            body: String::new(),
        });
        assert_eq!(status_label(&status), "error_503");

        let timeout: ResilienceError<DeliveryError> = TimeoutError {
            operation_id: "op".into(),
            timeout: Duration::from_millis(5),
            elapsed: Duration::from_millis(6),
        }
        .into();
        assert_eq!(status_label(&timeout), "error_timeout");

        let open: ResilienceError<DeliveryError> = CircuitOpenError {
            breaker: "hooks.example.com".into(),
            retry_after: Duration::from_secs(1),
        }
        .into();
        assert_eq!(status_label(&open), "error_circuit_open");
    }

    #[test]
    fn test_serialize_errors_are_not_transient() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!DeliveryError::from(err).is_transient());
        assert!(DeliveryError::Status { status: 500, body: String::new() }.is_transient());
    }
}
