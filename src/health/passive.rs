//! Passive health tracking (failure detection from live traffic).
//!
//! # Responsibilities
//! - Observe breaker transitions caused by real calls
//! - Export per-dependency health as a gauge
//!
//! # Design Decisions
//! - Any transition into Open marks the dependency unhealthy
//! - Half-Open still counts as reachable for the gauge

use crate::observability::metrics;
use crate::resilience::{BreakerObserver, CircuitState};

/// Breaker observer publishing `relay_dependency_health`.
#[derive(Debug, Default)]
pub struct HealthObserver;

impl BreakerObserver for HealthObserver {
    fn on_state_change(&self, breaker: &str, _from: CircuitState, to: CircuitState) {
        metrics::record_dependency_health(breaker, to != CircuitState::Open);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::resilience::BreakerRegistry;
    use std::sync::Arc;

    #[test]
    fn test_observer_attaches_to_registry() {
        let breakers = BreakerRegistry::new(CircuitBreakerConfig::default());
        breakers.add_observer(Arc::new(HealthObserver));
        let breaker = breakers.get("hooks.example.com");
        breaker.force_open();
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
