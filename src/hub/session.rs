//! Session endpoints

use super::common::{ApiError, ApiResult};
use super::AppState;
use crate::manager::{ConnectRequest, Status};
use axum::{extract::State, Json};
use serde_json::{json, Value};
use tracing::debug;

/// GET /v1/health
pub async fn health() -> &'static str {
    "ok"
}

/// GET /v1/ping
pub async fn ping() -> Json<Value> {
    Json(json!({ "pong": "ok" }))
}

/// GET /v1/status
pub async fn status(State(state): State<AppState>) -> Json<Status> {
    Json(state.manager.status().await)
}

/// POST /v1/connect
pub async fn connect(
    State(state): State<AppState>,
    Json(request): Json<ConnectRequest>,
) -> ApiResult<Json<Status>> {
    debug!("Connect request for provider {:?}", request.provider);
    state
        .manager
        .connect(request)
        .await
        .map(Json)
        .map_err(ApiError::bad_request)
}

/// POST /v1/disconnect
pub async fn disconnect(State(state): State<AppState>) -> Json<Status> {
    Json(state.manager.disconnect().await)
}
