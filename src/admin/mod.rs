//! Admin HTTP API.
//!
//! # Routes
//! ```text
//! GET    /health
//! GET    /subscriptions
//! POST   /subscriptions
//! GET    /subscriptions/{id}
//! PATCH  /subscriptions/{id}
//! DELETE /subscriptions/{id}
//! POST   /subscriptions/{id}/test
//! GET    /subscriptions/{id}/deliveries?limit=N
//! POST   /events
//! ```
//!
//! # Design Decisions
//! - No authentication; bind to loopback or put it behind a gateway
//! - Secrets are redacted everywhere except the creation response

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use self::handlers::*;

pub use self::handlers::AdminState;

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/subscriptions", get(list_subscriptions).post(create_subscription))
        .route(
            "/subscriptions/{id}",
            get(get_subscription)
                .patch(update_subscription)
                .delete(delete_subscription),
        )
        .route("/subscriptions/{id}/test", post(test_subscription))
        .route("/subscriptions/{id}/deliveries", get(delivery_history))
        .route("/events", post(trigger_event))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the admin API on `listener` until shutdown.
pub async fn serve(
    listener: TcpListener,
    state: AdminState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "Admin API listening");

    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    tracing::info!("Admin API stopped");
    Ok(())
}
