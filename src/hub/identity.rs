//! Device identity endpoints

use super::common::{ApiError, ApiResult};
use super::AppState;
use crate::identity::{identity_path, IdentitySummary};
use axum::{extract::State, Json};
use serde_json::{json, Value};

/// Sanitized identity of the configured state directory
pub(super) async fn summary(state: &AppState) -> crate::Result<IdentitySummary> {
    let state_dir = state.manager.state_dir();
    let identity = state.manager.identity_store().load(&state_dir).await?;
    Ok(IdentitySummary::new(
        identity.as_ref(),
        &identity_path(&state_dir),
    ))
}

/// GET /v1/identity
pub async fn get_identity(State(state): State<AppState>) -> ApiResult<Json<IdentitySummary>> {
    summary(&state).await.map(Json).map_err(ApiError::internal)
}

/// POST /v1/identity/reset
pub async fn reset_identity(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state
        .manager
        .identity_store()
        .reset(&state.manager.state_dir())
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(json!({ "status": "reset" })))
}
