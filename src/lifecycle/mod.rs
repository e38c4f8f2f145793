//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Build services → Start dispatcher, monitor, admin API
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Broadcast → Cancel pending retries → Persist subscriptions → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - In-flight deliveries finish on their own; only scheduled retries are cancelled

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{Relay, StartupError};
