//! Control API (hub)
//!
//! Local HTTP interface used by the desktop front end to drive the
//! [`Manager`]: connect/disconnect, status, system proxy, identity and a
//! few diagnostics.

mod common;
mod diag;
mod identity;
mod proxy;
mod session;

pub use common::{ApiError, ApiResult};
pub use proxy::pac_script;

use crate::engine::EndpointScan;
use crate::manager::Manager;
use crate::system::SystemProxy;
use crate::{Error, Result};

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub system_proxy: Arc<dyn SystemProxy>,
    /// Scanner override; `None` runs the tunnel engine binary
    pub scanner: Option<Arc<dyn EndpointScan>>,
}

impl AppState {
    pub fn new(manager: Arc<Manager>, system_proxy: Arc<dyn SystemProxy>) -> Self {
        AppState {
            manager,
            system_proxy,
            scanner: None,
        }
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn EndpointScan>) -> Self {
        self.scanner = Some(scanner);
        self
    }
}

/// Create the main router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/health", get(session::health))
        .route("/v1/ping", get(session::ping))
        .route("/v1/status", get(session::status))
        .route("/v1/connect", post(session::connect))
        .route("/v1/disconnect", post(session::disconnect))
        .route("/v1/scan", post(diag::scan))
        .route("/v1/proxy/enable", post(proxy::enable))
        .route("/v1/proxy/disable", post(proxy::disable))
        .route("/proxy.pac", get(proxy::serve_pac))
        .route("/v1/identity", get(identity::get_identity))
        .route("/v1/identity/reset", post(identity::reset_identity))
        .route("/v1/diag", get(diag::diag))
        .route("/v1/test/socks", get(diag::test_socks))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind the control API listener
pub async fn bind_server(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| Error::BindUnavailable(format!("control API {}: {}", addr, e)))
}

/// Serve the control API on an already bound listener
pub async fn serve(state: AppState, listener: TcpListener) -> Result<()> {
    info!("Starting control API on {:?}", listener.local_addr().ok());
    axum::serve(listener, create_router(state)).await?;
    Ok(())
}
