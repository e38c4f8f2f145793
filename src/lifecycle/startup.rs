//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize all subsystems in dependency order
//! - Register seed subscriptions from config
//! - Start background tasks (dispatcher, health monitor, admin API)
//! - Persist state on the way out
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - The admin listener binds last (traffic only when ready)

use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::admin::{self, AdminState};
use crate::config::RelayConfig;
use crate::delivery::{
    AuditError, AuditSink, DeliveryError, DeliveryQueue, JsonlAuditSink, MemoryAuditSink,
    SubscriptionError, SubscriptionRegistry,
};
use crate::health::{HealthMonitor, HealthObserver};
use crate::lifecycle::{signals, Shutdown};
use crate::resilience::Resilience;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("admin listener: {0}")]
    Io(#[from] std::io::Error),
}

/// Every long-lived service, built once and shared by `Arc`.
pub struct Relay {
    pub config: RelayConfig,
    pub resilience: Arc<Resilience>,
    pub registry: Arc<SubscriptionRegistry>,
    pub queue: Arc<DeliveryQueue>,
    pub shutdown: Shutdown,
}

impl Relay {
    pub async fn build(config: RelayConfig) -> Result<Self, StartupError> {
        let resilience = Arc::new(Resilience::from_config(&config));
        resilience.breakers().add_observer(Arc::new(HealthObserver));

        let registry = Arc::new(SubscriptionRegistry::load(&config.delivery)?);
        seed_subscriptions(&registry, &config)?;

        let audit: Arc<dyn AuditSink> = match &config.audit.path {
            Some(path) => {
                tracing::info!(path = %path, "Writing delivery audit to file");
                Arc::new(JsonlAuditSink::open(path).await?)
            }
            None => Arc::new(MemoryAuditSink::new(config.audit.memory_capacity)),
        };

        let queue = Arc::new(DeliveryQueue::new(
            &config,
            registry.clone(),
            resilience.clone(),
            audit,
        )?);

        tracing::info!(
            subscriptions = registry.count(),
            failure_threshold = config.circuit_breaker.failure_threshold,
            cooldown_ms = config.circuit_breaker.cooldown_ms,
            "Relay initialized"
        );

        Ok(Self {
            config,
            resilience,
            registry,
            queue,
            shutdown: Shutdown::new(),
        })
    }

    pub fn admin_state(&self) -> AdminState {
        AdminState {
            queue: self.queue.clone(),
            resilience: self.resilience.clone(),
        }
    }

    /// Run until SIGINT/SIGTERM, then drain and persist.
    pub async fn run(self) -> Result<(), StartupError> {
        let dispatcher = self.queue.start(self.shutdown.subscribe());

        let monitor = HealthMonitor::new(self.resilience.clone(), self.config.health.clone());
        let monitor = tokio::spawn(monitor.run(self.shutdown.subscribe()));

        let admin = if self.config.admin.enabled {
            let listener = TcpListener::bind(&self.config.admin.bind_address).await?;
            Some(tokio::spawn(admin::serve(
                listener,
                self.admin_state(),
                self.shutdown.subscribe(),
            )))
        } else {
            None
        };

        signals::wait_for_signal().await;
        self.shutdown.trigger();

        let _ = dispatcher.await;
        let _ = monitor.await;
        if let Some(admin) = admin {
            match admin.await {
                Ok(Err(e)) => tracing::error!(error = %e, "Admin API failed"),
                Err(e) => tracing::error!(error = %e, "Admin API task panicked"),
                Ok(Ok(())) => {}
            }
        }

        self.registry.save()?;
        tracing::info!("Shutdown complete");
        Ok(())
    }
}

/// Register `[[subscriptions]]` entries not already known from the subscriptions file.
fn seed_subscriptions(registry: &SubscriptionRegistry, config: &RelayConfig) -> Result<(), SubscriptionError> {
    for seed in &config.subscriptions {
        let known = match &seed.id {
            Some(id) => registry.get(id).is_some(),
            None => registry.list().iter().any(|s| s.url == seed.url),
        };
        if known {
            tracing::debug!(url = %seed.url, "Seed subscription already registered");
            continue;
        }
        registry.register(seed.clone())?;
    }
    Ok(())
}
