use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::SubscriptionConfig;
use crate::delivery::{
    AuditError, DeliveryQueue, DeliveryRecord, Subscription, SubscriptionError, SubscriptionPatch,
};
use crate::health::{self, HealthReport, HealthStatus};
use crate::resilience::Resilience;

/// Shared state of the admin API.
#[derive(Clone)]
pub struct AdminState {
    pub queue: Arc<DeliveryQueue>,
    pub resilience: Arc<Resilience>,
}

/// Error body: `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    Subscription(SubscriptionError),
    Audit(AuditError),
}

impl From<SubscriptionError> for ApiError {
    fn from(e: SubscriptionError) -> Self {
        ApiError::Subscription(e)
    }
}

impl From<AuditError> for ApiError {
    fn from(e: AuditError) -> Self {
        ApiError::Audit(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Subscription(e) => {
                let status = match e {
                    SubscriptionError::NotFound(_) => StatusCode::NOT_FOUND,
                    SubscriptionError::Duplicate(_) => StatusCode::CONFLICT,
                    SubscriptionError::InvalidUrl { .. } | SubscriptionError::NoEvents => {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                    SubscriptionError::Persistence(_) | SubscriptionError::Corrupt(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.to_string())
            }
            ApiError::Audit(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        if status.is_server_error() {
            tracing::error!(error = %message, "Admin request failed");
        }
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub queued: usize,
}

#[derive(Debug, Serialize)]
pub struct TestResponse {
    pub delivery_id: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    #[serde(flatten)]
    pub report: HealthReport,
    pub version: &'static str,
    pub active_operations: usize,
    pub pending_retries: usize,
    pub subscriptions: usize,
}

/// Write the registry to disk off the async runtime; failures are only logged.
async fn persist(state: &AdminState) {
    let registry = state.queue.registry().clone();
    match tokio::task::spawn_blocking(move || registry.save()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "Failed to persist subscriptions"),
        Err(e) => tracing::warn!(error = %e, "Subscription persistence task failed"),
    }
}

pub async fn list_subscriptions(State(state): State<AdminState>) -> Json<Vec<Subscription>> {
    Json(
        state
            .queue
            .registry()
            .list()
            .iter()
            .map(Subscription::redacted)
            .collect(),
    )
}

/// The only response that carries the secret, so generated secrets can be stored by the caller.
pub async fn create_subscription(
    State(state): State<AdminState>,
    Json(config): Json<SubscriptionConfig>,
) -> Result<(StatusCode, Json<Subscription>), ApiError> {
    let sub = state.queue.registry().register(config)?;
    persist(&state).await;
    Ok((StatusCode::CREATED, Json(sub)))
}

pub async fn get_subscription(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<Subscription>, ApiError> {
    state
        .queue
        .registry()
        .get(&id)
        .map(|s| Json(s.redacted()))
        .ok_or_else(|| SubscriptionError::NotFound(id).into())
}

pub async fn update_subscription(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(patch): Json<SubscriptionPatch>,
) -> Result<Json<Subscription>, ApiError> {
    let sub = state.queue.registry().update(&id, patch)?;
    persist(&state).await;
    Ok(Json(sub.redacted()))
}

pub async fn delete_subscription(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.queue.remove(&id)?;
    persist(&state).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn trigger_event(
    State(state): State<AdminState>,
    Json(request): Json<TriggerRequest>,
) -> (StatusCode, Json<TriggerResponse>) {
    let queued = state.queue.trigger(&request.event, request.data);
    (StatusCode::ACCEPTED, Json(TriggerResponse { queued }))
}

pub async fn test_subscription(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<TestResponse>), ApiError> {
    let delivery_id = state.queue.send_test(&id)?;
    Ok((StatusCode::ACCEPTED, Json(TestResponse { delivery_id })))
}

pub async fn delivery_history(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<DeliveryRecord>>, ApiError> {
    if state.queue.registry().get(&id).is_none() {
        return Err(SubscriptionError::NotFound(id).into());
    }
    let records = state.queue.audit().history(&id, query.limit).await?;
    Ok(Json(records))
}

pub async fn get_health(State(state): State<AdminState>) -> (StatusCode, Json<HealthResponse>) {
    let report = health::report(state.resilience.breakers());
    let status = if report.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status,
        Json(HealthResponse {
            report,
            version: env!("CARGO_PKG_VERSION"),
            active_operations: state.resilience.timeouts().active_count(),
            pending_retries: state.queue.scheduler().pending(),
            subscriptions: state.queue.registry().count(),
        }),
    )
}
