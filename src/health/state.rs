//! Dependency health derived from breaker state.
//!
//! # Mapping
//! ```text
//! Closed    → healthy
//! Half-Open → degraded (probing)
//! Open      → unhealthy
//! ```
//!
//! # Design Decisions
//! - Breakers are the single source of truth; no separate counters
//! - Aggregate is healthy with no dependencies, unhealthy only when all are open

use serde::Serialize;
use tokio::time::Instant;

use crate::resilience::{BreakerRegistry, BreakerSnapshot, CircuitState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl From<CircuitState> for HealthStatus {
    fn from(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed => HealthStatus::Healthy,
            CircuitState::HalfOpen => HealthStatus::Degraded,
            CircuitState::Open => HealthStatus::Unhealthy,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyHealth {
    pub name: String,
    pub status: HealthStatus,
    pub circuit: CircuitState,
    pub failures: u32,
    pub successes: u32,
    /// Milliseconds until an open breaker admits a probe.
    pub retry_after_ms: Option<u64>,
}

impl DependencyHealth {
    fn from_snapshot(name: String, snapshot: &BreakerSnapshot, now: Instant) -> Self {
        Self {
            name,
            status: snapshot.state.into(),
            circuit: snapshot.state,
            failures: snapshot.failures,
            successes: snapshot.successes,
            retry_after_ms: snapshot
                .next_attempt_at
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub dependencies: Vec<DependencyHealth>,
}

/// Health of every dependency known to `breakers`.
pub fn report(breakers: &BreakerRegistry) -> HealthReport {
    let now = Instant::now();
    let dependencies: Vec<DependencyHealth> = breakers
        .snapshots()
        .into_iter()
        .map(|(name, snapshot)| DependencyHealth::from_snapshot(name, &snapshot, now))
        .collect();

    HealthReport {
        status: aggregate(&dependencies),
        dependencies,
    }
}

fn aggregate(dependencies: &[DependencyHealth]) -> HealthStatus {
    let unhealthy = dependencies
        .iter()
        .filter(|d| d.status == HealthStatus::Unhealthy)
        .count();

    if !dependencies.is_empty() && unhealthy == dependencies.len() {
        HealthStatus::Unhealthy
    } else if dependencies.iter().any(|d| d.status != HealthStatus::Healthy) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
