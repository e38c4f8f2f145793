//! Subscription and delivery data types.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Event type matching every event.
pub const WILDCARD_EVENT: &str = "*";

/// Event type sent by test deliveries.
pub const TEST_EVENT: &str = "webhook.test";

/// A registered webhook endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub url: String,
    pub secret: String,
    pub events: BTreeSet<String>,
    pub enabled: bool,
    /// Retries after the first attempt.
    pub retry_count: u32,
    pub timeout_ms: u64,
    /// Overrides the configured per-window delivery limit.
    #[serde(default)]
    pub rate_limit: Option<u32>,

    /// Consecutive failed deliveries; reset by a success.
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub last_triggered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_status: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Subscription {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether an event of `event_type` should be delivered here.
    pub fn matches(&self, event_type: &str) -> bool {
        self.enabled
            && !self.is_deleted()
            && (self.events.contains(event_type) || self.events.contains(WILDCARD_EVENT))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Copy safe to return from APIs.
    pub fn redacted(&self) -> Subscription {
        Subscription {
            secret: "***".to_string(),
            ..self.clone()
        }
    }
}

/// Partial update of a subscription. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionPatch {
    pub url: Option<String>,
    pub secret: Option<String>,
    pub events: Option<Vec<String>>,
    pub enabled: Option<bool>,
    pub retry_count: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub rate_limit: Option<u32>,
}

/// JSON body POSTed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    /// ISO-8601 UTC with millisecond precision.
    pub timestamp: String,
    pub data: serde_json::Value,
}

impl WebhookPayload {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            data,
        }
    }
}

/// One event on its way to one subscription.
#[derive(Debug, Clone)]
pub struct DeliveryTask {
    /// `<subscription id>_<epoch ms>`, stable across retries.
    pub delivery_id: String,
    pub subscription_id: String,
    pub payload: Arc<WebhookPayload>,
    /// 0-indexed attempt about to run.
    pub attempt: u32,
}

impl DeliveryTask {
    pub fn new(subscription_id: &str, payload: Arc<WebhookPayload>) -> Self {
        Self {
            delivery_id: format!("{subscription_id}_{}", Utc::now().timestamp_millis()),
            subscription_id: subscription_id.to_string(),
            payload,
            attempt: 0,
        }
    }
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Success,
    /// Failed; another attempt is scheduled.
    Retrying,
    /// Failed for good.
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Success => "success",
            DeliveryStatus::Retrying => "retrying",
            DeliveryStatus::Failed => "failed",
        }
    }
}

/// Audit entry for one delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub delivery_id: String,
    pub subscription_id: String,
    pub event: String,
    pub attempt: u32,
    pub status: DeliveryStatus,
    pub status_code: Option<u16>,
    /// Response body, truncated.
    pub response_body: Option<String>,
    /// `error_*` label for failed attempts.
    pub error: Option<String>,
    pub duration_ms: u64,
    pub next_retry_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// Keep at most `limit` characters of `body`.
pub fn truncate_body(body: &str, limit: usize) -> String {
    match body.char_indices().nth(limit) {
        Some((cut, _)) => body[..cut].to_string(),
        None => body.to_string(),
    }
}
