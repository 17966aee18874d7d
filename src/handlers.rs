use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::error::{Error, Result};
use crate::headers::header_map_from_json;
use crate::health::{check_redis, HealthStatus};
use crate::lock::LockManager;
use crate::metrics::{LockOutcome, MetricsCollector};
use crate::protocol::{LockRequest, RequestMeta, ResponseRelay, Token, WireMessage};
use crate::rate_limiter::RateLimiter;
use crate::redis::TemplateStore;

/// Shared application state
pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub limiter: RateLimiter,
    pub locks: LockManager,
    pub store: Option<TemplateStore>,
    pub metrics: MetricsCollector,
}

/// Acquire or renew a named lock
pub async fn acquire_lock(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse> {
    let request = LockRequest::parse(body)?;

    let result = state.locks.acquire(&name, request).await;
    let outcome = match &result {
        Ok(_) => LockOutcome::Granted,
        Err(Error::LockTimeout { .. }) => LockOutcome::TimedOut,
        Err(_) => LockOutcome::Rejected,
    };
    state.metrics.record_lock(outcome).await;

    Ok(Json(result?.serialize()?))
}

/// Release a named lock held by the presented token
pub async fn release_lock(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse> {
    let token = Token::parse(body)?;

    state.locks.release(&name, &token)?;
    state.metrics.record_lock(LockOutcome::Released).await;

    Ok(StatusCode::NO_CONTENT)
}

/// Decide whether a request may be sent now
pub async fn authorize(
    State(state): State<SharedState>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse> {
    let meta = RequestMeta::parse(body)?;

    let authorization = state.limiter.authorize(&meta)?;
    state.metrics.record_authorization(&authorization).await;

    Ok(Json(authorization.serialize()?))
}

/// Fold a relayed response into bucket state
pub async fn relay_response(
    State(state): State<SharedState>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse> {
    let relay = ResponseRelay::parse(body)?;
    let headers = header_map_from_json(&relay.headers);

    let tightened = state
        .limiter
        .observe(&relay.request, relay.response.status, &headers)?;
    state.metrics.record_relay().await;

    if let (Some(store), Some((shape, snapshot))) = (&state.store, tightened) {
        if let Err(e) = store.save(&shape, snapshot).await {
            warn!(shape = %shape, error = %e, "Failed to persist template");
        }
    }

    Ok(StatusCode::NO_CONTENT)
}

/// Return the reservation of a dispatch that failed before any response
pub async fn cancel_dispatch(
    State(state): State<SharedState>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse> {
    let meta = RequestMeta::parse(body)?;

    state.limiter.cancel(&meta)?;

    Ok(StatusCode::NO_CONTENT)
}

/// Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> Result<impl IntoResponse> {
    let redis = check_redis(state.store.as_ref()).await;
    let status = HealthStatus::new(state.limiter.stats()?, state.locks.stats()?, redis);

    Ok(Json(status))
}

/// Service counters
pub async fn metrics(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.metrics.snapshot().await)
}
