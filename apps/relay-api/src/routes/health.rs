use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    /// Unix seconds at the time of the check.
    pub ts: i64,
    pub instance_id: String,
}

/// Liveness only; never touches the presence store or the bus.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Process is up", body = HealthResponse),
    )
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        ts: relay_common::clock::unix_now(),
        instance_id: state.config.instance_id.clone(),
    })
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    pub instance_id: String,
    /// Open connections owned by this process.
    pub connections: usize,
    /// Session topics this process is subscribed to.
    pub subscribed_sessions: usize,
}

#[utoipa::path(
    get,
    path = "/status",
    tag = "Health",
    responses(
        (status = 200, description = "Local relay counters", body = StatusResponse),
    )
)]
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        instance_id: state.config.instance_id.clone(),
        connections: state.registry.len(),
        subscribed_sessions: state.registry.subscribed_topics().await,
    })
}
