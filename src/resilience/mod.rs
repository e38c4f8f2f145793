//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to a dependency:
//!     → retries.rs (bounded attempts, backoff clamped to the deadline)
//!     → circuit_breaker.rs (fail fast while the dependency is judged down)
//!     → timeouts.rs (bound each attempt, cancel the work on expiry)
//!     → outcome flows back: breaker counters, retry decision, caller
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a limit
//! - A deadline is shared by the whole call tree; children only shrink it
//! - Open breakers and spent deadlines are never retried
//! - Circuit breaker prevents cascading failures
//! - All resilience logic is composable higher-order wrapping

pub mod backoff;
pub mod circuit_breaker;
pub mod deadline;
pub mod error;
pub mod manager;
pub mod retries;
pub mod schedule;
pub mod timeouts;

pub use circuit_breaker::{
    BreakerObserver, BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitState,
};
pub use deadline::Deadline;
pub use error::{CircuitOpenError, DeadlineExceeded, ResilienceError, TimeoutError};
pub use manager::{CallOptions, Resilience};
pub use retries::{RetryPolicy, Retrying};
pub use schedule::{ScheduleHandle, Scheduler};
pub use timeouts::{OperationContext, OperationStats, RunOptions, TimeoutManager};
