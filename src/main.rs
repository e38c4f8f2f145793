//! Outbound relay service.
//!
//! Delivers signed event notifications to subscriber endpoints and shields
//! callers from unreliable dependencies.
//!
//! # Architecture Overview
//!
//! ```text
//!    admin API (axum)            ┌──────────────────────────────────────────────┐
//!    POST /events ──────────────▶│  delivery::queue  (fan-out, rate limit)      │
//!    /subscriptions CRUD ───────▶│  delivery::registry (persisted JSON)         │
//!                                └──────────────┬───────────────────────────────┘
//!                                               │ one task per delivery
//!                                               ▼
//!                                ┌──────────────────────────────────────────────┐
//!                                │  resilience                                  │
//!                                │  retry/backoff → circuit breaker → timeouts  │
//!                                └──────────────┬───────────────────────────────┘
//!                                               │ signed POST
//!                                               ▼
//!                                         subscriber endpoints
//!
//!    Cross-cutting: config · health · observability · lifecycle
//! ```

use clap::Parser;
use std::path::PathBuf;

use outbound_relay::config::{load_config, RelayConfig};
use outbound_relay::observability::{logging, metrics};
use outbound_relay::Relay;

#[derive(Parser)]
#[command(name = "outbound-relay")]
#[command(about = "Resilient signed webhook delivery", long_about = None)]
struct Args {
    /// TOML configuration file; defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => RelayConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "outbound-relay starting");

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let relay = Relay::build(config).await?;
    relay.run().await?;
    Ok(())
}
