//! Retry, breaker and deadline composed through the public API.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use outbound_relay::config::RelayConfig;
use outbound_relay::resilience::{
    BreakerObserver, CallOptions, CircuitState, Deadline, Resilience, ResilienceError, RetryPolicy,
    RunOptions,
};

fn config(failure_threshold: u32, cooldown_ms: u64) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.circuit_breaker.failure_threshold = failure_threshold;
    config.circuit_breaker.success_threshold = 1;
    config.circuit_breaker.cooldown_ms = cooldown_ms;
    config.retries.initial_delay_ms = 5;
    config.retries.max_delay_ms = 20;
    config.retries.jitter = false;
    config
}

#[derive(Default)]
struct Transitions(Mutex<Vec<(String, CircuitState)>>);

impl BreakerObserver for Transitions {
    fn on_state_change(&self, breaker: &str, _from: CircuitState, to: CircuitState) {
        self.0.lock().push((breaker.to_string(), to));
    }
}

#[tokio::test]
async fn test_never_resolving_work_times_out_without_late_result() {
    let resilience = Resilience::from_config(&RelayConfig::default());
    let started = Instant::now();
    let delivered = Arc::new(AtomicU32::new(0));
    let flag = delivered.clone();

    let err = resilience
        .timeouts()
        .run(RunOptions::new("llm-call").timeout(Duration::from_millis(50)), |_token| async move {
            std::future::pending::<()>().await;
            flag.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>(())
        })
        .await
        .unwrap_err();

    let ResilienceError::Timeout(timeout) = err else {
        panic!("expected a timeout");
    };
    assert_eq!(timeout.operation_id, "llm-call");
    assert_eq!(timeout.timeout, Duration::from_millis(50));
    assert!(started.elapsed() < Duration::from_millis(250));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    assert_eq!(resilience.timeouts().active_count(), 0);
}

#[tokio::test]
async fn test_breaker_recovers_through_half_open() {
    let resilience = Resilience::from_config(&config(2, 50));
    let transitions = Arc::new(Transitions::default());
    resilience.breakers().add_observer(transitions.clone());
    let policy = RetryPolicy::<&str>::default().with_max_attempts(1);

    for _ in 0..2 {
        let err = resilience
            .call("rpc-node", &policy, CallOptions::default(), |_| async { Err::<(), _>("503") })
            .await
            .unwrap_err();
        assert_eq!(err.into_inner(), Some("503"));
    }

    let invoked = AtomicU32::new(0);
    let rejected = resilience
        .call("rpc-node", &policy, CallOptions::default(), |_| {
            invoked.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, &str>(()) }
        })
        .await
        .unwrap_err();
    assert!(rejected.is_circuit_open());
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(60)).await;
    resilience
        .call("rpc-node", &policy, CallOptions::default(), |_| async { Ok::<_, &str>(()) })
        .await
        .unwrap();

    let seen: Vec<CircuitState> = transitions.0.lock().iter().map(|(_, to)| *to).collect();
    assert_eq!(
        seen,
        vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]
    );
    assert!(transitions.0.lock().iter().all(|(name, _)| name == "rpc-node"));
}

#[tokio::test]
async fn test_dependencies_have_independent_breakers() {
    let resilience = Resilience::from_config(&config(1, 60_000));
    let policy = RetryPolicy::<&str>::default().with_max_attempts(1);

    resilience
        .call("llm", &policy, CallOptions::default(), |_| async { Err::<(), _>("down") })
        .await
        .unwrap_err();
    assert_eq!(resilience.breakers().get("llm").state(), CircuitState::Open);

    let ok = resilience
        .call("chain", &policy, CallOptions::default(), |_| async { Ok::<_, &str>(7) })
        .await
        .unwrap();
    assert_eq!(ok, 7);
}

#[tokio::test]
async fn test_child_deadline_bounds_nested_work() {
    let resilience = Resilience::from_config(&RelayConfig::default());
    let parent = Deadline::after(Duration::from_millis(100));
    let child = parent.child(Duration::from_secs(5));
    assert!(child.remaining() <= Duration::from_millis(100));

    let started = Instant::now();
    let err = resilience
        .timeouts()
        .run(
            RunOptions::new("nested").timeout(Duration::from_secs(5)).deadline(child),
            |_token| std::future::pending::<Result<(), ()>>(),
        )
        .await
        .unwrap_err();

    assert!(err.is_deadline_exceeded());
    assert!(!err.is_retryable());
    assert!(started.elapsed() < Duration::from_millis(300));
}

#[tokio::test]
async fn test_predicate_and_wrapped_work() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let policy = RetryPolicy::<String>::default()
        .with_max_attempts(5)
        .with_initial_delay(Duration::from_millis(1))
        .with_jitter(false)
        .with_should_retry(|err, _attempt| err.inner().map_or(false, |e| e != "fatal"));

    let wrapped = policy.wrap(move |attempt| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt < 2 {
                Err(ResilienceError::Inner("flaky".to_string()))
            } else {
                Err(ResilienceError::Inner("fatal".to_string()))
            }
        }
    });

    let err: ResilienceError<String> = wrapped.call::<(), _>().await.unwrap_err();
    assert_eq!(err.into_inner().as_deref(), Some("fatal"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}
