//! HTTP surface: registration, broadcast trigger, job status and the
//! VAPID public key readback.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;
use crate::store::SubscriptionStore;
use crate::types::{JobId, SubscriptionInfo};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<dyn SubscriptionStore>,
    pub vapid_public_key: Arc<str>,
    pub max_ttl: Duration,
}

/// Body of a broadcast request. A string payload is sent verbatim, any
/// other JSON value is sent serialized.
#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub payload: serde_json::Value,
    /// Seconds the push service may hold the message.
    pub ttl: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BroadcastResponse {
    pub job_id: JobId,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/vapidPublicKey", get(vapid_public_key))
        .route("/register", post(register))
        .route("/broadcast", post(broadcast))
        .route("/sendNotificationToAll", post(broadcast))
        .route("/jobs/{id}", get(job_status).delete(cancel_job))
        .with_state(state)
}

async fn vapid_public_key(State(state): State<AppState>) -> String {
    state.vapid_public_key.to_string()
}

async fn register(
    State(state): State<AppState>,
    Json(info): Json<SubscriptionInfo>,
) -> Response {
    let subscription = match info.into_subscription() {
        Ok(s) => s,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };

    match state.store.put(subscription).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => {
            tracing::error!(error = %err, "registration failed");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn broadcast(
    State(state): State<AppState>,
    Json(request): Json<BroadcastRequest>,
) -> Response {
    let payload = match request.payload {
        serde_json::Value::String(text) => text.into_bytes(),
        other => match serde_json::to_vec(&other) {
            Ok(bytes) => bytes,
            Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
        },
    };
    let ttl = Duration::from_secs(request.ttl).min(state.max_ttl);

    match state.dispatcher.broadcast(payload, ttl).await {
        Ok(job_id) => (StatusCode::ACCEPTED, Json(BroadcastResponse { job_id })).into_response(),
        Err(err @ DispatchError::PayloadTooLarge { .. }) => {
            (StatusCode::PAYLOAD_TOO_LARGE, err.to_string()).into_response()
        }
        Err(err) => {
            tracing::warn!(error = %err, "broadcast rejected");
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
        }
    }
}

async fn job_status(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.dispatcher.job_status(&JobId(id)).await {
        Some(status) => Json(status).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<Uuid>) -> StatusCode {
    if state.dispatcher.cancel(&JobId(id)).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
