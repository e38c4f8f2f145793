//! Asynchronous webhook delivery queue.
//!
//! # Data Flow
//! ```text
//! trigger(event, data)
//!     → registry.matching(event) → one DeliveryTask per subscription
//!     → mpsc channel → dispatcher spawns one task per delivery
//!     → rate limiter (over limit: requeue after a short delay)
//!     → breaker for the endpoint host → timeout manager → signed POST
//!     → success: reset failure count
//!     → failure: backoff via the scheduler, or mark failed when exhausted
//!     → every attempt: audit sink + broadcast of the DeliveryRecord
//! ```
//!
//! # Design Decisions
//! - Each delivery runs in its own task; a hanging endpoint blocks nobody else
//! - Retries are re-enqueued through the scheduler instead of sleeping in place
//! - A timed-out request future is dropped, aborting the HTTP call
//! - `last_status` changes only on terminal outcomes
//! - Tasks still queued or waiting to retry at shutdown end as `failed` with
//!   `error_cancelled`, so every delivery leaves a terminal record
//! - Response bodies are read only up to what the audit record keeps

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{DeliveryConfig, RelayConfig};
use crate::delivery::audit::AuditSink;
use crate::delivery::error::{status_label, DeliveryError, SubscriptionError};
use crate::delivery::rate_limit::FixedWindowLimiter;
use crate::delivery::registry::SubscriptionRegistry;
use crate::delivery::signing;
use crate::delivery::types::{
    truncate_body, DeliveryRecord, DeliveryStatus, DeliveryTask, Subscription, WebhookPayload,
    TEST_EVENT,
};
use crate::observability::metrics;
use crate::resilience::{Resilience, ResilienceError, RetryPolicy, RunOptions, Scheduler};

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";
pub const DELIVERY_HEADER: &str = "X-Webhook-Delivery";

/// Status label of deliveries abandoned without a final attempt.
pub const CANCELLED_LABEL: &str = "error_cancelled";

/// A 2xx answer from a subscriber.
#[derive(Debug)]
struct Reply {
    status: u16,
    body: String,
}

/// Breaker name for a webhook URL: its `host[:port]`.
pub fn breaker_key(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            _ => url.to_string(),
        },
        Err(_) => url.to_string(),
    }
}

/// Fans events out to subscriptions and drives every delivery to a terminal outcome.
pub struct DeliveryQueue {
    registry: Arc<SubscriptionRegistry>,
    resilience: Arc<Resilience>,
    audit: Arc<dyn AuditSink>,
    scheduler: Scheduler,
    limiter: FixedWindowLimiter,
    client: reqwest::Client,
    config: DeliveryConfig,
    default_rate_limit: u32,
    tx: mpsc::UnboundedSender<DeliveryTask>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<DeliveryTask>>>,
    records: broadcast::Sender<DeliveryRecord>,
    /// Tasks waiting on the scheduler, keyed by deferral sequence.
    deferred: Arc<DashMap<u64, DeliveryTask>>,
    deferred_seq: AtomicU64,
    closed: AtomicBool,
}

impl DeliveryQueue {
    pub fn new(
        config: &RelayConfig,
        registry: Arc<SubscriptionRegistry>,
        resilience: Arc<Resilience>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("outbound-relay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (records, _) = broadcast::channel(config.delivery.event_buffer.max(1));

        Ok(Self {
            registry,
            resilience,
            audit,
            scheduler: Scheduler::new(),
            limiter: FixedWindowLimiter::new(config.rate_limit.window()),
            client,
            config: config.delivery.clone(),
            default_rate_limit: config.rate_limit.max_per_window,
            tx,
            rx: Mutex::new(Some(rx)),
            records,
            deferred: Arc::new(DashMap::new()),
            deferred_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// Receive every delivery record from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryRecord> {
        self.records.subscribe()
    }

    /// Queue `event_type` for every matching subscription. Returns how many were queued.
    pub fn trigger(&self, event_type: &str, data: serde_json::Value) -> usize {
        let payload = Arc::new(WebhookPayload::new(event_type, data));
        let targets = self.registry.matching(event_type);
        for sub in &targets {
            self.enqueue(DeliveryTask::new(&sub.id, payload.clone()));
        }
        tracing::debug!(event = %event_type, subscriptions = targets.len(), "Event triggered");
        targets.len()
    }

    /// Soft-delete a subscription and drop its rate-limit window.
    pub fn remove(&self, subscription_id: &str) -> Result<Subscription, SubscriptionError> {
        let removed = self.registry.remove(subscription_id)?;
        self.limiter.forget(subscription_id);
        Ok(removed)
    }

    /// Queue a `webhook.test` event for one subscription. Returns the delivery id.
    pub fn send_test(&self, subscription_id: &str) -> Result<String, SubscriptionError> {
        let sub = self
            .registry
            .get(subscription_id)
            .filter(|s| !s.is_deleted())
            .ok_or_else(|| SubscriptionError::NotFound(subscription_id.to_string()))?;

        let payload = WebhookPayload::new(
            TEST_EVENT,
            serde_json::json!({
                "subscription_id": sub.id,
                "message": "test delivery",
            }),
        );
        let task = DeliveryTask::new(&sub.id, Arc::new(payload));
        let delivery_id = task.delivery_id.clone();
        self.enqueue(task);
        Ok(delivery_id)
    }

    fn enqueue(&self, task: DeliveryTask) {
        if self.tx.send(task).is_err() {
            tracing::error!("Delivery dispatcher is gone, task dropped");
        }
    }

    /// Re-enqueue `task` after `delay`. Once the queue is closed the task is
    /// handed back for the caller to abandon.
    #[must_use]
    fn enqueue_after(&self, delay: Duration, task: DeliveryTask) -> Option<DeliveryTask> {
        let key = self.deferred_seq.fetch_add(1, Ordering::Relaxed);
        self.deferred.insert(key, task);
        if self.closed.load(Ordering::SeqCst) {
            return self.deferred.remove(&key).map(|(_, task)| task);
        }

        let tx = self.tx.clone();
        let deferred = self.deferred.clone();
        self.scheduler.schedule(delay, move || async move {
            if let Some((key, task)) = deferred.remove(&key) {
                // Closed channel: park it again for the shutdown drain.
                if let Err(mpsc::error::SendError(task)) = tx.send(task) {
                    deferred.insert(key, task);
                }
            }
        });
        None
    }

    /// Spawn the dispatcher; it stops on shutdown and cancels pending retries.
    pub fn start(self: &Arc<Self>, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(shutdown))
    }

    /// Dispatcher loop. Only the first call does anything.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let receiver = self.rx.lock().take();
        let Some(mut rx) = receiver else {
            tracing::warn!("Delivery dispatcher already running");
            return;
        };
        tracing::info!("Delivery dispatcher started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                task = rx.recv() => match task {
                    Some(task) => {
                        let queue = self.clone();
                        tokio::spawn(async move { queue.process(task).await });
                    }
                    None => break,
                },
            }
        }

        self.closed.store(true, Ordering::SeqCst);
        rx.close();
        let cancelled = self.scheduler.cancel_all();

        let mut abandoned = 0usize;
        while let Ok(task) = rx.try_recv() {
            self.abandon(task).await;
            abandoned += 1;
        }
        let keys: Vec<u64> = self.deferred.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, task)) = self.deferred.remove(&key) {
                self.abandon(task).await;
                abandoned += 1;
            }
        }
        tracing::info!(
            cancelled_retries = cancelled,
            abandoned,
            "Delivery dispatcher stopped"
        );
    }

    /// Close out a task that will never be attempted again.
    async fn abandon(&self, task: DeliveryTask) {
        self.registry.mark_failure(&task.subscription_id, CANCELLED_LABEL);
        tracing::warn!(
            subscription_id = %task.subscription_id,
            delivery_id = %task.delivery_id,
            attempt = task.attempt,
            "Delivery abandoned"
        );
        let record = self.record(&task, DeliveryStatus::Failed, Duration::ZERO, |r| {
            r.error = Some(CANCELLED_LABEL.to_string());
        });
        self.publish(record, Duration::ZERO).await;
    }

    async fn publish(&self, record: DeliveryRecord, duration: Duration) {
        metrics::record_delivery(record.status.as_str(), duration);
        if let Err(e) = self.audit.record(&record).await {
            tracing::error!(error = %e, delivery_id = %record.delivery_id, "Failed to write audit record");
        }
        let _ = self.records.send(record);
    }

    /// Run one attempt of `task` and decide what happens next.
    async fn process(&self, task: DeliveryTask) {
        let Some(sub) = self.registry.get(&task.subscription_id) else {
            tracing::debug!(subscription_id = %task.subscription_id, "Subscription vanished, dropping task");
            return;
        };
        if sub.is_deleted() || (!sub.enabled && task.payload.event != TEST_EVENT) {
            tracing::debug!(subscription_id = %sub.id, "Subscription inactive, dropping task");
            if sub.is_deleted() {
                self.limiter.forget(&sub.id);
            }
            // Earlier attempts left a retrying record; close it out.
            if task.attempt > 0 {
                self.abandon(task).await;
            }
            return;
        }

        let limit = sub.rate_limit.unwrap_or(self.default_rate_limit);
        if !self.limiter.try_acquire(&sub.id, limit) {
            let delay = Duration::from_millis(self.config.requeue_delay_ms);
            tracing::debug!(subscription_id = %sub.id, delay = ?delay, "Rate limited, requeueing");
            if let Some(task) = self.enqueue_after(delay, task) {
                self.abandon(task).await;
            }
            return;
        }

        self.registry.mark_attempt(&sub.id);
        let started = Instant::now();
        let result = self.attempt(&sub, &task).await;
        let duration = started.elapsed();

        let (record, retry) = match result {
            Ok(reply) => {
                self.registry.mark_success(&sub.id);
                tracing::info!(
                    subscription_id = %sub.id,
                    delivery_id = %task.delivery_id,
                    attempt = task.attempt,
                    status = reply.status,
                    "Webhook delivered"
                );
                let record = self.record(&task, DeliveryStatus::Success, duration, |r| {
                    r.status_code = Some(reply.status);
                    r.response_body = Some(truncate_body(&reply.body, self.config.response_body_limit));
                });
                (record, None)
            }
            Err(error) => self.handle_failure(&sub, task, error, duration),
        };

        let leftover = retry.and_then(|(delay, next)| self.enqueue_after(delay, next));
        self.publish(record, duration).await;
        if let Some(task) = leftover {
            self.abandon(task).await;
        }
    }

    fn handle_failure(
        &self,
        sub: &Subscription,
        task: DeliveryTask,
        error: ResilienceError<DeliveryError>,
        duration: Duration,
    ) -> (DeliveryRecord, Option<(Duration, DeliveryTask)>) {
        let label = status_label(&error);
        let status_code = error.inner().and_then(DeliveryError::status_code);
        let body = match error.inner() {
            Some(DeliveryError::Status { body, .. }) => {
                Some(truncate_body(body, self.config.response_body_limit))
            }
            _ => None,
        };

        match self.retry_policy(sub).next_delay(task.attempt, &error) {
            Some(delay) => {
                tracing::info!(
                    subscription_id = %sub.id,
                    delivery_id = %task.delivery_id,
                    attempt = task.attempt,
                    delay = ?delay,
                    error = %error,
                    "Delivery failed, retrying"
                );
                metrics::record_retry_attempt();
                let record = self.record(&task, DeliveryStatus::Retrying, duration, |r| {
                    r.status_code = status_code;
                    r.response_body = body;
                    r.error = Some(label);
                    r.next_retry_ms = Some(delay.as_millis() as u64);
                });
                let mut next = task;
                next.attempt += 1;
                (record, Some((delay, next)))
            }
            None => {
                self.registry.mark_failure(&sub.id, &label);
                tracing::warn!(
                    subscription_id = %sub.id,
                    delivery_id = %task.delivery_id,
                    attempts = task.attempt + 1,
                    status = %label,
                    error = %error,
                    "Delivery failed"
                );
                let record = self.record(&task, DeliveryStatus::Failed, duration, |r| {
                    r.status_code = status_code;
                    r.response_body = body;
                    r.error = Some(label);
                });
                (record, None)
            }
        }
    }

    /// `retry_count` retries, `base * 2^attempt` apart, capped, without jitter.
    fn retry_policy(&self, sub: &Subscription) -> RetryPolicy<DeliveryError> {
        RetryPolicy::default()
            .with_max_attempts(sub.retry_count.saturating_add(1))
            .with_initial_delay(Duration::from_millis(self.config.backoff_base_ms))
            .with_max_delay(Duration::from_millis(self.config.max_backoff_ms))
            .with_backoff_factor(2.0)
            .with_jitter(false)
            .with_should_retry(|error: &ResilienceError<DeliveryError>, _attempt| {
                error.inner().map_or(true, DeliveryError::is_transient)
            })
    }

    /// One signed POST through the endpoint's breaker, bounded by the subscription timeout.
    async fn attempt(
        &self,
        sub: &Subscription,
        task: &DeliveryTask,
    ) -> Result<Reply, ResilienceError<DeliveryError>> {
        let body = serde_json::to_vec(task.payload.as_ref())
            .map_err(|e| ResilienceError::Inner(DeliveryError::from(e)))?;
        let breaker = self.resilience.breakers().get(&breaker_key(&sub.url));
        let options = RunOptions::new(format!("{}#{}", task.delivery_id, task.attempt))
            .timeout(sub.timeout());

        breaker
            .execute(|| {
                self.resilience
                    .timeouts()
                    .run(options, |_token| self.post(sub, task, body))
            })
            .await
    }

    async fn post(&self, sub: &Subscription, task: &DeliveryTask, body: Vec<u8>) -> Result<Reply, DeliveryError> {
        let signature = signing::sign(&sub.secret, &body);
        let mut response = self
            .client
            .post(&sub.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(EVENT_HEADER, &task.payload.event)
            .header(TIMESTAMP_HEADER, &task.payload.timestamp)
            .header(DELIVERY_HEADER, &task.delivery_id)
            .body(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        // Enough bytes for `response_body_limit` characters of UTF-8.
        let cap = self.config.response_body_limit.saturating_mul(4);
        let mut bytes = Vec::with_capacity(cap.min(16 * 1024));
        while bytes.len() < cap {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let take = chunk.len().min(cap - bytes.len());
                    bytes.extend_from_slice(&chunk[..take]);
                }
                Ok(None) | Err(_) => break,
            }
        }
        let text = String::from_utf8_lossy(&bytes).into_owned();
        if (200..300).contains(&status) {
            Ok(Reply { status, body: text })
        } else {
            Err(DeliveryError::Status { status, body: text })
        }
    }

    fn record(
        &self,
        task: &DeliveryTask,
        status: DeliveryStatus,
        duration: Duration,
        fill: impl FnOnce(&mut DeliveryRecord),
    ) -> DeliveryRecord {
        let mut record = DeliveryRecord {
            delivery_id: task.delivery_id.clone(),
            subscription_id: task.subscription_id.clone(),
            event: task.payload.event.clone(),
            attempt: task.attempt,
            status,
            status_code: None,
            response_body: None,
            error: None,
            duration_ms: duration.as_millis() as u64,
            next_retry_ms: None,
            timestamp: chrono::Utc::now(),
        };
        fill(&mut record);
        record
    }
}
