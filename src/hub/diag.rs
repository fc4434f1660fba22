//! Diagnostics and connectivity tests

use super::common::{non_empty, ApiError, ApiResult, ScanRequest, SocksTestParams};
use super::AppState;
use crate::common::net::probe_tcp;
use crate::engine::{Endpoint, EndpointScan, WarpScanner};
use crate::engine::virtualization::CONFIG_FILE;
use crate::outbound::http_get_via;
use crate::provider::ENGINE_LOG_FILE;
use axum::{
    extract::{Query, State},
    Json,
};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const RELAY_PROBE_TIMEOUT: Duration = Duration::from_millis(350);
const ENGINE_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

const DEFAULT_TEST_HOST: &str = "ip-api.com";
const DEFAULT_TEST_PATH: &str = "/json";

/// GET /v1/diag
pub async fn diag(State(state): State<AppState>) -> Json<Value> {
    let status = state.manager.status().await;
    let settings = state.manager.settings();
    let state_dir = state.manager.state_dir();

    let engine_bind = settings.engine_bind();
    let bind = if status.bind.is_empty() {
        engine_bind.clone()
    } else {
        status.bind.clone()
    };
    let (listening, engine_listening) = tokio::join!(
        probe_tcp(&bind, RELAY_PROBE_TIMEOUT),
        probe_tcp(&engine_bind, ENGINE_PROBE_TIMEOUT)
    );

    let identity = match super::identity::summary(&state).await {
        Ok(summary) => json!(summary),
        Err(e) => json!({ "error": e.to_string() }),
    };

    Json(json!({
        "status": status,
        "identity": identity,
        "env": {
            "WARPPLUS_BIN": std::env::var("WARPPLUS_BIN").unwrap_or_default(),
            "SINGBOX_BIN": std::env::var("SINGBOX_BIN").unwrap_or_default(),
        },
        "paths": {
            "stateDir": state_dir.display().to_string(),
            "warpLog": state_dir.join(ENGINE_LOG_FILE).display().to_string(),
            "singboxConfig": state_dir.join(CONFIG_FILE).display().to_string(),
        },
        "socks": {
            "bind": bind,
            "listening": listening,
            "warpBind": engine_bind,
            "warpListening": engine_listening,
        },
    }))
}

/// GET /v1/test/socks
pub async fn test_socks(
    State(state): State<AppState>,
    Query(params): Query<SocksTestParams>,
) -> ApiResult<Json<Value>> {
    let bind = non_empty(params.bind).unwrap_or_else(|| state.manager.settings().engine_bind());
    let host = non_empty(params.host).unwrap_or_else(|| DEFAULT_TEST_HOST.to_string());
    let path = non_empty(params.path).unwrap_or_else(|| DEFAULT_TEST_PATH.to_string());
    debug!("SOCKS test via {} to {}{}", bind, host, path);

    let (status, body) = http_get_via(&bind, &host, &path, 0)
        .await
        .map_err(ApiError::bad_request)?;
    Ok(Json(json!({ "status": status, "body": body })))
}

/// POST /v1/scan
pub async fn scan(
    State(state): State<AppState>,
    body: Option<Json<ScanRequest>>,
) -> ApiResult<Json<Vec<Endpoint>>> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let scanner: std::sync::Arc<dyn EndpointScan> = match &state.scanner {
        Some(scanner) => scanner.clone(),
        None => {
            let bin = state
                .manager
                .settings()
                .warp_plus_bin(request.bin.as_deref());
            std::sync::Arc::new(WarpScanner::new(bin))
        }
    };
    scanner
        .scan()
        .await
        .map(Json)
        .map_err(ApiError::bad_request)
}
