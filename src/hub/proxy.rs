//! System proxy and PAC endpoints

use super::common::{non_empty, ApiError, ApiResult, BindParams};
use super::AppState;
use axum::{
    extract::{Query, State},
    http::header,
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};

pub const PAC_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";

/// PAC script sending everything through the SOCKS5 endpoint at `bind`
pub fn pac_script(bind: &str) -> String {
    format!(
        "function FindProxyForURL(url, host) {{ return \"SOCKS5 {}; DIRECT\"; }}",
        bind
    )
}

/// `?bind=`, then the session bind, then the engine bind
async fn effective_bind(state: &AppState, requested: Option<String>) -> String {
    if let Some(bind) = non_empty(requested) {
        return bind;
    }
    let status = state.manager.status().await;
    if !status.bind.is_empty() {
        return status.bind;
    }
    state.manager.settings().engine_bind()
}

/// GET /proxy.pac
pub async fn serve_pac(
    State(state): State<AppState>,
    Query(params): Query<BindParams>,
) -> impl IntoResponse {
    let bind = effective_bind(&state, params.bind).await;
    ([(header::CONTENT_TYPE, PAC_CONTENT_TYPE)], pac_script(&bind))
}

/// POST /v1/proxy/enable
pub async fn enable(
    State(state): State<AppState>,
    Query(params): Query<BindParams>,
) -> ApiResult<Json<Value>> {
    let bind = effective_bind(&state, params.bind).await;
    state
        .system_proxy
        .enable_pac(&state.manager.settings().pac_url())
        .await
        .map_err(ApiError::not_implemented)?;
    Ok(Json(json!({ "status": "enabled", "bind": bind })))
}

/// POST /v1/proxy/disable
pub async fn disable(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state
        .system_proxy
        .disable_pac()
        .await
        .map_err(ApiError::not_implemented)?;
    Ok(Json(json!({ "status": "disabled" })))
}
