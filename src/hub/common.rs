//! Common types for REST API responses and errors

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// `{"error": "..."}`
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub error: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        ApiError {
            error: message.into(),
        }
    }

    pub fn bad_request(message: impl ToString) -> (StatusCode, Json<ApiError>) {
        (StatusCode::BAD_REQUEST, Json(ApiError::new(message.to_string())))
    }

    pub fn internal(message: impl ToString) -> (StatusCode, Json<ApiError>) {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiError::new(message.to_string())),
        )
    }

    pub fn not_implemented(message: impl ToString) -> (StatusCode, Json<ApiError>) {
        (
            StatusCode::NOT_IMPLEMENTED,
            Json(ApiError::new(message.to_string())),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

/// Body of `POST /v1/scan`
#[derive(Debug, Default, Deserialize)]
pub struct ScanRequest {
    /// Tunnel engine executable to scan with
    #[serde(default)]
    pub bin: Option<String>,
}

/// `?bind=` for PAC and proxy endpoints
#[derive(Debug, Default, Deserialize)]
pub struct BindParams {
    pub bind: Option<String>,
}

/// Query of `GET /v1/test/socks`
#[derive(Debug, Default, Deserialize)]
pub struct SocksTestParams {
    pub bind: Option<String>,
    pub host: Option<String>,
    pub path: Option<String>,
}

/// Treat `?bind=` like a missing parameter
pub fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
