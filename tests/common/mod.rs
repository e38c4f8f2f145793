//! Shared utilities for integration testing.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use outbound_relay::config::{RelayConfig, SubscriptionConfig};
use outbound_relay::delivery::{
    AuditSink, DeliveryQueue, DeliveryRecord, MemoryAuditSink, Subscription, SubscriptionRegistry,
};
use outbound_relay::{Resilience, Shutdown};

/// One request received by a mock endpoint.
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ReceivedRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

type ResponseFuture = Pin<Box<dyn Future<Output = (u16, String)> + Send>>;
type Responder = Arc<dyn Fn(usize) -> ResponseFuture + Send + Sync>;

#[derive(Clone)]
struct MockState {
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
    respond: Responder,
}

/// A loopback HTTP endpoint that records every POST it receives.
pub struct MockEndpoint {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
}

#[allow(dead_code)]
impl MockEndpoint {
    pub fn url(&self) -> String {
        format!("http://{}/hook", self.addr)
    }

    pub fn count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.requests.lock().clone()
    }
}

/// Start a programmable mock endpoint. `f` gets the 0-indexed request number.
pub async fn start_programmable_endpoint<F, Fut>(f: F) -> MockEndpoint
where
    F: Fn(usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let requests = Arc::new(Mutex::new(Vec::new()));
    let respond: Responder = Arc::new(move |n| -> ResponseFuture { Box::pin(f(n)) });
    let state = MockState {
        requests: requests.clone(),
        respond,
    };

    let app = Router::new()
        .route("/hook", post(handle))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    MockEndpoint { addr, requests }
}

/// Start a mock endpoint that always answers `status`.
#[allow(dead_code)]
pub async fn start_mock_endpoint(status: u16) -> MockEndpoint {
    start_programmable_endpoint(move |_| async move { (status, "ok".to_string()) }).await
}

async fn handle(State(state): State<MockState>, headers: HeaderMap, body: Bytes) -> (StatusCode, String) {
    let n = {
        let mut requests = state.requests.lock();
        requests.push(ReceivedRequest { headers, body });
        requests.len() - 1
    };
    let (status, body) = (state.respond)(n).await;
    (StatusCode::from_u16(status).unwrap_or(StatusCode::OK), body)
}

/// Config with millisecond-scale backoff so retry tests finish quickly.
#[allow(dead_code)]
pub fn fast_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.delivery.backoff_base_ms = 20;
    config.delivery.max_backoff_ms = 200;
    config.delivery.requeue_delay_ms = 50;
    config.retries.initial_delay_ms = 10;
    config.retries.max_delay_ms = 50;
    config.retries.jitter = false;
    config.observability.metrics_enabled = false;
    config
}

/// A running delivery queue with an in-memory audit sink.
#[allow(dead_code)]
pub struct Harness {
    pub queue: Arc<DeliveryQueue>,
    pub registry: Arc<SubscriptionRegistry>,
    pub resilience: Arc<Resilience>,
    pub audit: Arc<MemoryAuditSink>,
    pub shutdown: Shutdown,
    pub records: broadcast::Receiver<DeliveryRecord>,
}

#[allow(dead_code)]
impl Harness {
    pub fn start(config: &RelayConfig) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new(&config.delivery));
        let resilience = Arc::new(Resilience::from_config(config));
        let audit = Arc::new(MemoryAuditSink::new(1000));
        let sink: Arc<dyn AuditSink> = audit.clone();
        let queue = Arc::new(
            DeliveryQueue::new(config, registry.clone(), resilience.clone(), sink).unwrap(),
        );
        let shutdown = Shutdown::new();
        let records = queue.subscribe();
        queue.start(shutdown.subscribe());

        Self {
            queue,
            registry,
            resilience,
            audit,
            shutdown,
            records,
        }
    }

    pub fn subscribe(&self, url: &str, events: &[&str], retry_count: u32) -> Subscription {
        self.registry
            .register(SubscriptionConfig {
                url: url.to_string(),
                secret: Some("whsec_test".to_string()),
                events: events.iter().map(|e| e.to_string()).collect(),
                enabled: true,
                retry_count: Some(retry_count),
                ..Default::default()
            })
            .unwrap()
    }

    /// Next record matching `pred`, or panic after `within`.
    pub async fn next_record<P>(&mut self, within: Duration, pred: P) -> DeliveryRecord
    where
        P: Fn(&DeliveryRecord) -> bool,
    {
        tokio::time::timeout(within, async {
            loop {
                let record = self.records.recv().await.unwrap();
                if pred(&record) {
                    return record;
                }
            }
        })
        .await
        .expect("no matching delivery record in time")
    }
}
