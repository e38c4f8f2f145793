//! Circuit breaker for dependency protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: probing whether the dependency recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= failure_threshold
//! Open → Half-Open: first call after the cooldown has elapsed
//! Half-Open → Closed: consecutive successes >= success_threshold
//! Half-Open → Open: any failure
//! ```
//!
//! Half-Open admits one probe at a time; other calls are rejected until the
//! probe reports back or is dropped.
//!
//! # Design Decisions
//! - Per-dependency circuit breaker (not global), handed out by `BreakerRegistry`
//! - Fail fast in Open state (the wrapped work is never invoked)
//! - Every transition resets both counters; only entering Open sets the next probe time
//! - All state lives behind one mutex so concurrent outcomes are never lost
//! - Observers run synchronously inside the transition, in registration order
//! - Breakers from one registry share its observer list

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::observability::metrics;
use crate::resilience::error::{CircuitOpenError, ResilienceError};

/// State of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives every state transition of the breakers it is attached to.
///
/// Called while the breaker's lock is held: implementations must return
/// quickly and must not call back into the same breaker.
pub trait BreakerObserver: Send + Sync {
    fn on_state_change(&self, breaker: &str, from: CircuitState, to: CircuitState);
}

/// Logs transitions and exports them as metrics.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl BreakerObserver for TracingObserver {
    fn on_state_change(&self, breaker: &str, from: CircuitState, to: CircuitState) {
        if to == CircuitState::Open {
            tracing::warn!(breaker = %breaker, from = %from, to = %to, "Circuit opened");
        } else {
            tracing::info!(breaker = %breaker, from = %from, to = %to, "Circuit state changed");
        }
        metrics::record_breaker_transition(breaker, to);
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub next_attempt_at: Option<Instant>,
}

type Observers = Arc<RwLock<Vec<Arc<dyn BreakerObserver>>>>;

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    successes: u32,
    next_attempt_at: Option<Instant>,
    /// Ticket of the Half-Open probe in flight.
    probe: Option<u64>,
    probes_issued: u64,
}

impl BreakerState {
    fn start_probe(&mut self) -> u64 {
        self.probes_issued += 1;
        self.probe = Some(self.probes_issued);
        self.probes_issued
    }

    /// True when `ticket` is the probe in flight; clears it.
    fn finish_probe(&mut self, ticket: Option<u64>) -> bool {
        if ticket.is_some() && self.probe == ticket {
            self.probe = None;
            true
        } else {
            false
        }
    }
}

/// Frees the probe slot if the probing call is dropped before it reports.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    ticket: Option<u64>,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.ticket.is_some() {
            self.breaker.state.lock().finish_probe(self.ticket);
        }
    }
}

/// Guards one named dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    observers: Observers,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_observers(name, config, Observers::default())
    }

    fn with_observers(name: impl Into<String>, config: CircuitBreakerConfig, observers: Observers) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                next_attempt_at: None,
                probe: None,
                probes_issued: 0,
            }),
            observers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Attach an observer; it sees transitions after those already attached.
    /// On a registry breaker this attaches it to the whole registry.
    pub fn add_observer(&self, observer: Arc<dyn BreakerObserver>) {
        self.observers.write().push(observer);
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.lock();
        BreakerSnapshot {
            state: state.state,
            failures: state.failures,
            successes: state.successes,
            next_attempt_at: state.next_attempt_at,
        }
    }

    /// Force the breaker back to Closed.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        self.transition(&mut state, CircuitState::Closed);
    }

    /// Force the breaker Open for a full cooldown.
    pub fn force_open(&self) {
        let mut state = self.state.lock();
        self.transition(&mut state, CircuitState::Open);
    }

    /// Run `op` if the breaker admits it, recording the outcome.
    ///
    /// Any `Err` from `op` counts as a failure; classifying errors is left to
    /// the retry layer.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let mut guard = ProbeGuard {
            breaker: self,
            ticket: self.acquire()?,
        };
        let result = op().await;
        let ticket = guard.ticket.take();

        match result {
            Ok(value) => {
                self.on_success(ticket);
                Ok(value)
            }
            Err(err) => {
                self.on_failure(ticket);
                Err(err)
            }
        }
    }

    /// Like [`execute`](Self::execute) for work that fails with a plain error.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute(|| async move { op().await.map_err(ResilienceError::Inner) })
            .await
    }

    /// Admit or reject a call, moving Open → Half-Open once the cooldown is over.
    ///
    /// Returns the probe ticket when the call is the Half-Open probe.
    fn acquire(&self) -> Result<Option<u64>, CircuitOpenError> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let (current, probing, next_attempt_at) = (state.state, state.probe.is_some(), state.next_attempt_at);
        match current {
            CircuitState::Closed => Ok(None),
            CircuitState::HalfOpen if !probing => Ok(Some(state.start_probe())),
            CircuitState::HalfOpen => Err(self.reject(Duration::ZERO)),
            CircuitState::Open => match next_attempt_at {
                Some(next) if now < next => Err(self.reject(next - now)),
                _ => {
                    self.transition(&mut state, CircuitState::HalfOpen);
                    Ok(Some(state.start_probe()))
                }
            },
        }
    }

    fn reject(&self, retry_after: Duration) -> CircuitOpenError {
        metrics::record_circuit_rejection(&self.name);
        CircuitOpenError {
            breaker: self.name.clone(),
            retry_after,
        }
    }

    // Outcomes of calls admitted under an earlier state (no matching probe
    // ticket) do not move a Half-Open or Open breaker.
    fn on_success(&self, ticket: Option<u64>) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => state.failures = 0,
            CircuitState::HalfOpen => {
                if state.finish_probe(ticket) {
                    state.successes += 1;
                    if state.successes >= self.config.success_threshold {
                        self.transition(&mut state, CircuitState::Closed);
                    }
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, ticket: Option<u64>) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => {
                state.failures += 1;
                if state.failures >= self.config.failure_threshold {
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                if state.finish_probe(ticket) {
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState) {
        let from = state.state;
        state.state = to;
        state.failures = 0;
        state.successes = 0;
        state.probe = None;
        state.next_attempt_at = match to {
            CircuitState::Open => Some(Instant::now() + self.config.cooldown()),
            _ => None,
        };

        if from != to {
            for observer in self.observers.read().iter() {
                observer.on_state_change(&self.name, from, to);
            }
        }
    }
}

/// Lazily creates one breaker per dependency name, all sharing a config and observers.
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    observers: Observers,
}

impl fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("config", &self.config)
            .field("breakers", &self.breakers.len())
            .finish()
    }
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            observers: Observers::default(),
        }
    }

    /// Registry whose breakers log and export their transitions.
    pub fn with_tracing(config: CircuitBreakerConfig) -> Self {
        let registry = Self::new(config);
        registry.add_observer(Arc::new(TracingObserver));
        registry
    }

    /// Attach an observer to every current and future breaker.
    pub fn add_observer(&self, observer: Arc<dyn BreakerObserver>) {
        self.observers.write().push(observer);
    }

    /// The breaker for `name`, created on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_observers(
                    name,
                    self.config.clone(),
                    self.observers.clone(),
                ))
            })
            .clone()
    }

    /// Look up a breaker without creating it.
    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|r| r.value().clone())
    }

    /// Snapshots of every known breaker, sorted by name.
    pub fn snapshots(&self) -> Vec<(String, BreakerSnapshot)> {
        let mut all: Vec<_> = self
            .breakers
            .iter()
            .map(|r| (r.key().clone(), r.value().snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config(failure_threshold: u32, success_threshold: u32, cooldown_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            cooldown_ms,
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), ResilienceError<&'static str>> {
        breaker.call(|| async { Err("boom") }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), ResilienceError<&'static str>> {
        breaker.call(|| async { Ok(()) }).await
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(CircuitState, CircuitState)>>);

    impl BreakerObserver for Recorder {
        fn on_state_change(&self, _breaker: &str, from: CircuitState, to: CircuitState) {
            self.0.lock().push((from, to));
        }
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new("llm", test_config(5, 2, 60_000));
        for _ in 0..5 {
            assert!(fail(&breaker).await.unwrap_err().inner().is_some());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result: Result<(), ResilienceError<&str>> = breaker
            .call(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("rpc", test_config(3, 1, 60_000));
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.snapshot().failures, 2);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.snapshot().failures, 0);
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_after_cooldown_lets_probe_through() {
        let breaker = CircuitBreaker::new("api", test_config(1, 2, 50));
        fail(&breaker).await.unwrap_err();
        assert!(succeed(&breaker).await.unwrap_err().is_circuit_open());

        tokio::time::sleep(Duration::from_millis(60)).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().successes, 1);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("api", test_config(1, 3, 30));
        fail(&breaker).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(40)).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        fail(&breaker).await.unwrap_err();

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.failures, 0);
        assert!(snapshot.next_attempt_at.is_some());
        assert!(succeed(&breaker).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn test_observers_see_transitions_in_order() {
        let breaker = CircuitBreaker::new("chain", test_config(1, 1, 20));
        let recorder = Arc::new(Recorder::default());
        breaker.add_observer(recorder.clone());

        fail(&breaker).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(30)).await;
        succeed(&breaker).await.unwrap();

        assert_eq!(
            *recorder.0.lock(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn test_half_open_admits_one_probe_at_a_time() {
        let breaker = Arc::new(CircuitBreaker::new("probe", test_config(1, 2, 20)));
        fail(&breaker).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let prober = breaker.clone();
        let probe = tokio::spawn(async move {
            prober
                .call(|| async move {
                    let _ = wait.await;
                    Ok::<_, &str>(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let invoked = AtomicU32::new(0);
        let second: Result<(), ResilienceError<&str>> = breaker
            .call(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(second.unwrap_err().is_circuit_open());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        release.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(breaker.snapshot().successes, 1);

        // The slot is free again for the next probe.
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_dropped_probe_frees_the_slot() {
        let breaker = CircuitBreaker::new("dropped", test_config(1, 1, 20));
        fail(&breaker).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            breaker.call(|| std::future::pending::<Result<(), &str>>()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_concurrent_failures_are_not_lost() {
        let breaker = Arc::new(CircuitBreaker::new("busy", test_config(1000, 1, 60_000)));
        let mut handles = Vec::new();
        for _ in 0..64 {
            let breaker = breaker.clone();
            handles.push(tokio::spawn(async move {
                let _ = breaker
                    .call(|| async {
                        tokio::task::yield_now().await;
                        Err::<(), _>("down")
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(breaker.snapshot().failures, 64);
    }

    #[tokio::test]
    async fn test_force_open_and_reset() {
        let breaker = CircuitBreaker::new("manual", test_config(5, 1, 60_000));
        breaker.force_open();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(succeed(&breaker).await.unwrap_err().is_circuit_open());

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failures, 0);
        succeed(&breaker).await.unwrap();
    }

    #[test]
    fn test_registry_reuses_breakers() {
        let registry = BreakerRegistry::new(test_config(5, 2, 1000));
        let recorder = Arc::new(Recorder::default());
        registry.add_observer(recorder.clone());

        let a = registry.get("hooks.example.com");
        let b = registry.get("hooks.example.com");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.find("other").is_none());

        a.force_open();
        assert_eq!(recorder.0.lock().len(), 1);
        assert_eq!(registry.snapshots()[0].1.state, CircuitState::Open);

        registry.reset_all();
        assert_eq!(a.state(), CircuitState::Closed);
    }

    #[test]
    fn test_registry_observer_attached_once() {
        let registry = Arc::new(BreakerRegistry::new(test_config(5, 1, 1000)));
        let recorder = Arc::new(Recorder::default());

        let creator = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    registry.get(&format!("dep-{i}"));
                }
            })
        };
        registry.add_observer(recorder.clone());
        creator.join().unwrap();

        for i in 0..200 {
            registry.get(&format!("dep-{i}")).force_open();
        }
        assert_eq!(recorder.0.lock().len(), 200);
    }
}
