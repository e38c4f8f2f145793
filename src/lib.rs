//! Outbound relay library: resilience primitives and signed webhook delivery.

pub mod admin;
pub mod config;
pub mod delivery;
pub mod health;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::RelayConfig;
pub use delivery::DeliveryQueue;
pub use lifecycle::{Relay, Shutdown};
pub use resilience::Resilience;
