//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the relay.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the relay.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    /// Admin API settings.
    pub admin: AdminConfig,

    /// Operation timeout defaults.
    pub timeouts: TimeoutConfig,

    /// Circuit breaker thresholds shared by every dependency.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Default retry policy for dependency calls.
    pub retries: RetryConfig,

    /// Webhook delivery settings.
    pub delivery: DeliveryConfig,

    /// Per-subscription rate limiting.
    pub rate_limit: RateLimitConfig,

    /// Delivery audit trail.
    pub audit: AuditConfig,

    /// Dependency health probing.
    pub health: HealthConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Subscriptions registered at startup.
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// Timeout configuration for bounded operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Timeout applied when a call supplies neither a timeout nor a deadline.
    pub default_ms: u64,

    /// Number of completed operations kept for statistics.
    pub history_capacity: usize,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_ms: 30_000,
            history_capacity: 1000,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed that open the circuit.
    pub failure_threshold: u32,

    /// Consecutive successes in Half-Open that close the circuit.
    pub success_threshold: u32,

    /// Time spent Open before a probe is allowed, in milliseconds.
    pub cooldown_ms: u64,
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown_ms: 60_000,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds.
    pub initial_delay_ms: u64,

    /// Upper bound on any single delay in milliseconds.
    pub max_delay_ms: u64,

    /// Multiplier applied per attempt.
    pub backoff_factor: f64,

    /// Randomize delays by ±25%.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

/// Webhook delivery configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Per-attempt HTTP timeout for subscriptions that do not set one.
    pub default_timeout_ms: u64,

    /// Retries after the first attempt for subscriptions that do not set one.
    pub default_retry_count: u32,

    /// Base of the `2^attempt` backoff in milliseconds.
    pub backoff_base_ms: u64,

    /// Cap on the backoff between delivery attempts in milliseconds.
    pub max_backoff_ms: u64,

    /// Characters of the response body kept in delivery records.
    pub response_body_limit: usize,

    /// Delay before a rate-limited attempt is tried again in milliseconds.
    pub requeue_delay_ms: u64,

    /// JSON file the subscription registry is loaded from and saved to.
    pub subscriptions_file: Option<String>,

    /// Capacity of the in-process delivery record broadcast.
    pub event_buffer: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5000,
            default_retry_count: 3,
            backoff_base_ms: 1000,
            max_backoff_ms: 60_000,
            response_body_limit: 1000,
            requeue_delay_ms: 1000,
            subscriptions_file: None,
            event_buffer: 1024,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Deliveries allowed per subscription per window.
    pub max_per_window: u32,

    /// Fixed window length in seconds.
    pub window_secs: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_window: 60,
            window_secs: 60,
        }
    }
}

/// Delivery audit configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Append records to this JSON-lines file instead of keeping them in memory.
    pub path: Option<String>,

    /// Records kept by the in-memory sink.
    pub memory_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: None,
            memory_capacity: 10_000,
        }
    }
}

/// Health probing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Enable active probing of `targets`.
    pub enabled: bool,

    /// Probe interval in seconds.
    pub interval_secs: u64,

    /// Probe timeout in seconds.
    pub timeout_secs: u64,

    /// Dependencies to probe.
    pub targets: Vec<HealthTarget>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 10,
            timeout_secs: 5,
            targets: Vec::new(),
        }
    }
}

/// A dependency probed with an HTTP GET.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthTarget {
    /// Breaker name the probe reports to.
    pub name: String,

    /// URL that must answer 2xx.
    pub url: String,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format ("pretty" or "json").
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// A subscription as registered through config or the admin API.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SubscriptionConfig {
    /// Fixed identifier; generated when absent.
    #[serde(default)]
    pub id: Option<String>,

    /// Endpoint receiving the POSTed events.
    pub url: String,

    /// HMAC key; generated when absent.
    #[serde(default)]
    pub secret: Option<String>,

    /// Event types delivered to this endpoint; `"*"` matches all.
    pub events: Vec<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Retries after the first attempt.
    #[serde(default)]
    pub retry_count: Option<u32>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Deliveries allowed per rate-limit window.
    #[serde(default)]
    pub rate_limit: Option<u32>,
}

fn default_enabled() -> bool {
    true
}
