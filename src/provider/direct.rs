//! `psiphon` provider: the engine serves SOCKS itself, no relay in front

use super::integration::{apply_integration, Integration};
use super::{Provider, ProviderDeps, ProviderKind};
use crate::common::net::wait_port;
use crate::engine::TunnelEngine;
use crate::manager::{ConnectRequest, Status, StatusCell};
use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Synchronous readiness bound for connect
pub const READY_TIMEOUT: Duration = Duration::from_secs(60);

pub const MSG_NOT_READY: &str = "engine started but SOCKS not ready";

struct Session {
    engine: TunnelEngine,
    integration: Integration,
}

pub struct DirectProvider {
    deps: ProviderDeps,
    ready_timeout: Duration,
    status: StatusCell,
    session: Mutex<Option<Session>>,
}

impl DirectProvider {
    pub fn new(deps: ProviderDeps) -> Self {
        DirectProvider {
            deps,
            ready_timeout: READY_TIMEOUT,
            status: StatusCell::default(),
            session: Mutex::new(None),
        }
    }

    pub fn with_ready_timeout(mut self, limit: Duration) -> Self {
        self.ready_timeout = limit;
        self
    }

    fn failed(&self, message: impl Into<String>) {
        self.status.set(Status {
            provider: ProviderKind::Direct.name().to_string(),
            message: message.into(),
            ..Default::default()
        });
    }

    async fn teardown(session: Session) {
        let Session {
            engine,
            mut integration,
        } = session;
        integration.teardown().await;
        if let Err(e) = engine.stop().await {
            warn!("Failed to stop tunnel engine: {}", e);
        }
    }
}

#[async_trait]
impl Provider for DirectProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Direct
    }

    async fn connect(&self, request: &ConnectRequest) -> Result<Status> {
        let mut slot = self.session.lock().await;
        if let Some(previous) = slot.take() {
            Self::teardown(previous).await;
        }

        let state_dir = self.deps.state_dir(request);
        tokio::fs::create_dir_all(&state_dir).await?;

        let bind = request
            .option("bind")
            .map(str::to_string)
            .unwrap_or_else(|| self.deps.settings.engine_bind());
        let config = self
            .deps
            .tunnel_config(ProviderKind::Direct, request, &state_dir, bind.clone());
        let engine = TunnelEngine::new(config, self.deps.runner.clone());

        if let Err(e) = engine.start().await {
            self.failed(e.to_string());
            return Err(e);
        }
        if let Err(e) = wait_port(&bind, self.ready_timeout).await {
            if let Err(stop_err) = engine.stop().await {
                warn!("Failed to stop tunnel engine: {}", stop_err);
            }
            self.failed(MSG_NOT_READY);
            return Err(e);
        }

        let mode = request.integration();
        let integration =
            match apply_integration(&self.deps, mode, &bind, &state_dir, self.deps.dns(request))
                .await
            {
                Ok(integration) => integration,
                Err(e) => {
                    if let Err(stop_err) = engine.stop().await {
                        warn!("Failed to stop tunnel engine: {}", stop_err);
                    }
                    self.failed(e.to_string());
                    return Err(e);
                }
            };

        let message = match &integration.warning {
            Some(w) => format!("connected ({})", w),
            None => "connected".to_string(),
        };
        self.status.set(Status {
            connected: true,
            provider: ProviderKind::Direct.name().to_string(),
            exit_country: request.exit_country().map(str::to_string),
            message,
            integration: mode.as_str().to_string(),
            bind: bind.clone(),
            pac_enabled: integration.pac_enabled,
            virtualization_active: integration.virtualization_active(),
            ..Default::default()
        });
        info!("psiphon engine serving SOCKS on {}", bind);

        *slot = Some(Session {
            engine,
            integration,
        });
        Ok(self.status.get())
    }

    async fn disconnect(&self) -> Result<()> {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            Self::teardown(session).await;
        }
        self.status.set(Status::default());
        Ok(())
    }

    fn status(&self) -> Status {
        let mut status = self.status.get();
        // the engine is the only thing serving, so its exit ends the session
        if status.connected {
            if let Ok(slot) = self.session.try_lock() {
                if let Some(session) = slot.as_ref() {
                    if !session.engine.is_active() {
                        status.connected = false;
                        status.message = session
                            .engine
                            .last_error()
                            .unwrap_or_else(|| Error::ProcessExit("engine stopped".into()).to_string());
                    }
                }
            }
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::process::mock::MockRunner;
    use crate::system::UnsupportedSystemProxy;
    use std::sync::Arc;

    fn provider(runner: MockRunner) -> DirectProvider {
        let dir = std::env::temp_dir().join(format!("tk-direct-{}", uuid::Uuid::new_v4()));
        let deps = ProviderDeps {
            settings: Arc::new(Settings {
                state_dir: dir,
                ..Default::default()
            }),
            runner: Arc::new(runner),
            scanner: None,
            system_proxy: Arc::new(UnsupportedSystemProxy),
        };
        DirectProvider::new(deps).with_ready_timeout(Duration::from_millis(300))
    }

    fn request() -> ConnectRequest {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let bind = l.local_addr().unwrap().to_string();
        drop(l);
        let mut req = ConnectRequest::new("psiphon").with_option("bind", bind);
        req.exit_country = Some("AT".into());
        req
    }

    #[tokio::test]
    async fn test_connect_waits_for_engine() {
        let runner = MockRunner::new().listen_when(|_| true);
        let provider = provider(runner.clone());
        let req = request();

        let status = provider.connect(&req).await.unwrap();
        assert!(status.connected);
        assert_eq!(status.message, "connected");
        assert_eq!(status.bind, req.option("bind").unwrap());

        let args = &runner.started()[0].args;
        assert!(args.contains(&"--cfon".to_string()));
        assert!(args.contains(&"AT".to_string()));

        provider.disconnect().await.unwrap();
        assert!(!provider.status().connected);
        assert_eq!(runner.processes()[0].kill_count(), 1);
    }

    #[tokio::test]
    async fn test_not_ready_fails_connect() {
        let runner = MockRunner::new();
        let provider = provider(runner.clone());

        let err = provider.connect(&request()).await.unwrap_err();
        assert!(matches!(err, Error::ReadinessTimeout(_)));
        assert_eq!(provider.status().message, MSG_NOT_READY);
        assert_eq!(runner.processes()[0].kill_count(), 1);
    }

    #[tokio::test]
    async fn test_engine_exit_reported() {
        let runner = MockRunner::new().listen_when(|_| true);
        let provider = provider(runner.clone());
        provider.connect(&request()).await.unwrap();

        runner.processes()[0].exit(Err("signal: 9".into()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = provider.status();
        assert!(!status.connected);
        assert!(status.message.contains("signal: 9"));
        provider.disconnect().await.unwrap();
    }
}
