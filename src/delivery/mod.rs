//! Outbound webhook delivery.
//!
//! # Data Flow
//! ```text
//! registry.rs (who wants which events)
//!     → queue.rs (fan-out, rate limit, signed POST, retry scheduling)
//!     → audit.rs (every attempt recorded)
//! ```
//!
//! # Design Decisions
//! - At-least-once: failures are retried until `retry_count` is spent
//! - Rate limiting delays deliveries, it never drops them
//! - Subscriptions are soft-deleted so their history stays readable

pub mod audit;
pub mod error;
pub mod queue;
pub mod rate_limit;
pub mod registry;
pub mod signing;
pub mod types;

pub use audit::{AuditError, AuditSink, JsonlAuditSink, MemoryAuditSink};
pub use error::{DeliveryError, SubscriptionError};
pub use queue::DeliveryQueue;
pub use registry::SubscriptionRegistry;
pub use types::{
    DeliveryRecord, DeliveryStatus, DeliveryTask, Subscription, SubscriptionPatch, WebhookPayload,
};
