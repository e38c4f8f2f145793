//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Periodic timer
//!     → Probe each target through its breaker
//!
//! Passive health checks (passive.rs):
//!     Live call fails or recovers
//!     → Breaker transition
//!     → Dependency health gauge
//!
//! State (state.rs):
//!     Breaker snapshots → per-dependency and aggregate health
//! ```
//!
//! # Design Decisions
//! - Active and passive checks are complementary
//! - Hysteresis comes from the breaker thresholds
//! - Health state is per-dependency

pub mod active;
pub mod passive;
pub mod state;

pub use active::HealthMonitor;
pub use passive::HealthObserver;
pub use state::{report, DependencyHealth, HealthReport, HealthStatus};
