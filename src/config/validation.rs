//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds > 0, factors >= 1, windows > 0)
//! - Validate addresses and seed subscription URLs
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RelayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::RelayConfig;
use crate::delivery::registry::validate_subscription;

/// One semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Check every semantic constraint, collecting all failures.
pub fn validate_config(config: &RelayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.admin.enabled && config.admin.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new("admin.bind_address", "not a socket address"));
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "not a socket address",
        ));
    }
    if !matches!(config.observability.log_format.as_str(), "pretty" | "json") {
        errors.push(ValidationError::new(
            "observability.log_format",
            "must be \"pretty\" or \"json\"",
        ));
    }

    if config.timeouts.default_ms == 0 {
        errors.push(ValidationError::new("timeouts.default_ms", "must be greater than 0"));
    }
    if config.timeouts.history_capacity == 0 {
        errors.push(ValidationError::new("timeouts.history_capacity", "must be greater than 0"));
    }

    let breaker = &config.circuit_breaker;
    if breaker.failure_threshold == 0 {
        errors.push(ValidationError::new("circuit_breaker.failure_threshold", "must be greater than 0"));
    }
    if breaker.success_threshold == 0 {
        errors.push(ValidationError::new("circuit_breaker.success_threshold", "must be greater than 0"));
    }

    let retries = &config.retries;
    if retries.max_attempts == 0 {
        errors.push(ValidationError::new("retries.max_attempts", "must be at least 1"));
    }
    if !(retries.backoff_factor >= 1.0) {
        errors.push(ValidationError::new("retries.backoff_factor", "must be at least 1.0"));
    }
    if retries.initial_delay_ms > retries.max_delay_ms {
        errors.push(ValidationError::new(
            "retries.initial_delay_ms",
            "must not exceed retries.max_delay_ms",
        ));
    }

    let delivery = &config.delivery;
    if delivery.default_timeout_ms == 0 {
        errors.push(ValidationError::new("delivery.default_timeout_ms", "must be greater than 0"));
    }
    if delivery.backoff_base_ms > delivery.max_backoff_ms {
        errors.push(ValidationError::new(
            "delivery.backoff_base_ms",
            "must not exceed delivery.max_backoff_ms",
        ));
    }
    if delivery.requeue_delay_ms == 0 {
        errors.push(ValidationError::new("delivery.requeue_delay_ms", "must be greater than 0"));
    }
    if delivery.event_buffer == 0 {
        errors.push(ValidationError::new("delivery.event_buffer", "must be greater than 0"));
    }

    if config.rate_limit.max_per_window == 0 {
        errors.push(ValidationError::new("rate_limit.max_per_window", "must be greater than 0"));
    }
    if config.rate_limit.window_secs == 0 {
        errors.push(ValidationError::new("rate_limit.window_secs", "must be greater than 0"));
    }

    if config.audit.path.is_none() && config.audit.memory_capacity == 0 {
        errors.push(ValidationError::new("audit.memory_capacity", "must be greater than 0"));
    }

    if config.health.enabled {
        if config.health.interval_secs == 0 {
            errors.push(ValidationError::new("health.interval_secs", "must be greater than 0"));
        }
        if config.health.timeout_secs == 0 {
            errors.push(ValidationError::new("health.timeout_secs", "must be greater than 0"));
        }
        for (i, target) in config.health.targets.iter().enumerate() {
            if url::Url::parse(&target.url).is_err() {
                errors.push(ValidationError::new(format!("health.targets[{i}].url"), "invalid URL"));
            }
        }
    }

    let mut ids = HashSet::new();
    for (i, sub) in config.subscriptions.iter().enumerate() {
        if let Err(e) = validate_subscription(&sub.url, &sub.events) {
            errors.push(ValidationError::new(format!("subscriptions[{i}]"), e.to_string()));
        }
        if sub.rate_limit == Some(0) {
            errors.push(ValidationError::new(
                format!("subscriptions[{i}].rate_limit"),
                "must be greater than 0",
            ));
        }
        if let Some(id) = &sub.id {
            if !ids.insert(id.as_str()) {
                errors.push(ValidationError::new(
                    format!("subscriptions[{i}].id"),
                    format!("duplicate id {id}"),
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
