//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe configured dependencies
//! - Feed probe outcomes into each dependency's breaker, so an open breaker
//!   is re-probed after its cooldown even without live traffic

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time;

use crate::config::{HealthConfig, HealthTarget};
use crate::delivery::DeliveryError;
use crate::resilience::{Resilience, ResilienceError, RunOptions};

pub struct HealthMonitor {
    resilience: Arc<Resilience>,
    config: HealthConfig,
    client: reqwest::Client,
}

impl HealthMonitor {
    pub fn new(resilience: Arc<Resilience>, config: HealthConfig) -> Self {
        Self {
            resilience,
            config,
            client: reqwest::Client::new(),
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled || self.config.targets.is_empty() {
            tracing::info!("Active health checks disabled");
            return;
        }

        tracing::info!(
            interval = self.config.interval_secs,
            targets = self.config.targets.len(),
            "Health monitor starting"
        );

        let mut ticker = time::interval(Duration::from_secs(self.config.interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Probe every target once, concurrently.
    pub async fn check_all(&self) {
        let probes = self.config.targets.iter().map(|target| self.check(target));
        futures_util::future::join_all(probes).await;
    }

    /// Probe one target. Returns whether it answered 2xx in time.
    pub async fn check(&self, target: &HealthTarget) -> bool {
        let breaker = self.resilience.breakers().get(&target.name);
        let options = RunOptions::new(format!("health-{}", target.name))
            .timeout(Duration::from_secs(self.config.timeout_secs));

        let result = breaker
            .execute(|| {
                self.resilience
                    .timeouts()
                    .run(options, |_token| self.probe(&target.url))
            })
            .await;

        match result {
            Ok(()) => true,
            Err(ResilienceError::CircuitOpen(open)) => {
                tracing::debug!(
                    dependency = %target.name,
                    retry_after = ?open.retry_after,
                    "Skipping probe, circuit open"
                );
                false
            }
            Err(e) => {
                tracing::warn!(dependency = %target.name, url = %target.url, error = %e, "Health check failed");
                false
            }
        }
    }

    async fn probe(&self, url: &str) -> Result<(), DeliveryError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, "outbound-relay-health-check")
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status {
                status: status.as_u16(),
                body: String::new(),
            })
        }
    }
}
