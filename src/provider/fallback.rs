//! Relay-fronted tunnel provider (`warp`, `gool`)
//!
//! Connect binds the public relay right away and returns. The tunnel engine
//! is found by a [`CandidateSearch`] running in a background task that owns
//! the session's status sender; until it wins, the relay either dials
//! directly or refuses connections.

use super::bind::{choose_public_bind, persist_bind};
use super::integration::{apply_integration, Integration};
use super::{Provider, ProviderDeps, ProviderKind, ENGINE_LOG_FILE};
use crate::common::net::wait_port;
use crate::config::PUBLIC_PORT_RANGE;
use crate::engine::{TunnelConfig, TunnelEngine};
use crate::inbound::{InboundListener, Relay, RelayConfig};
use crate::manager::{ConnectRequest, Status, StatusCell};
use crate::search::{candidate_test_urls, CandidateCheck, CandidateSearch};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const MSG_WARMING: &str = "connected (relay; tunnel warming)";
pub const MSG_HANDSHAKE: &str = "connected (handshake ok; warming)";
pub const MSG_ACTIVE: &str = "connected (tunnel active)";

const HANDSHAKE_MARKER: &str = "handshake complete";
const HANDSHAKE_POLL: Duration = Duration::from_millis(1500);
const HANDSHAKE_WINDOW: Duration = Duration::from_secs(120);
const ACTIVE_WAIT: Duration = Duration::from_secs(180);
const HEALTH_POLL: Duration = Duration::from_secs(1);
const SEARCH_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

type EngineSlot = Arc<Mutex<Option<TunnelEngine>>>;

struct Session {
    relay: Arc<Relay>,
    integration: Integration,
    cancel: CancellationToken,
    search: Option<JoinHandle<()>>,
    engine: EngineSlot,
}

/// Provider that keeps a relay up while searching for a working engine
pub struct TunnelProvider {
    kind: ProviderKind,
    deps: ProviderDeps,
    check: Option<Arc<dyn CandidateCheck>>,
    status: StatusCell,
    session: Mutex<Option<Session>>,
}

impl TunnelProvider {
    pub fn new(kind: ProviderKind, deps: ProviderDeps) -> Self {
        TunnelProvider {
            kind,
            deps,
            check: None,
            status: StatusCell::default(),
            session: Mutex::new(None),
        }
    }

    /// Require `check` to pass before a candidate is accepted
    pub fn with_check(mut self, check: Arc<dyn CandidateCheck>) -> Self {
        self.check = Some(check);
        self
    }

    /// Status cell updated by the background search
    pub fn status_cell(&self) -> &StatusCell {
        &self.status
    }

    fn search(&self, bin: &str) -> CandidateSearch {
        let search = CandidateSearch::new(
            self.deps.runner.clone(),
            self.deps.scanner_for(bin),
            self.deps.settings.search.clone(),
        );
        match &self.check {
            Some(check) => search.with_check(check.clone()),
            None => search,
        }
    }

    async fn teardown(session: Session) {
        let Session {
            relay,
            mut integration,
            cancel,
            search,
            engine,
        } = session;

        cancel.cancel();
        integration.teardown().await;

        if let Some(mut task) = search {
            if timeout(SEARCH_JOIN_TIMEOUT, &mut task).await.is_err() {
                warn!("Candidate search did not stop in time, aborting it");
                task.abort();
            }
        }

        if let Some(engine) = engine.lock().await.take() {
            if let Err(e) = engine.stop().await {
                warn!("Failed to stop tunnel engine: {}", e);
            }
        }

        if let Err(e) = relay.stop().await {
            warn!("Failed to stop relay: {}", e);
        }
    }
}

#[async_trait]
impl Provider for TunnelProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn connect(&self, request: &ConnectRequest) -> Result<Status> {
        let mut slot = self.session.lock().await;
        if let Some(previous) = slot.take() {
            Self::teardown(previous).await;
        }

        let settings = &self.deps.settings;
        let state_dir = self.deps.state_dir(request);
        tokio::fs::create_dir_all(&state_dir).await?;

        let bind = choose_public_bind(
            &state_dir,
            request.option("bind"),
            settings.engine_port,
            PUBLIC_PORT_RANGE,
        )
        .await?;
        let relay = Arc::new(Relay::new(RelayConfig {
            listen: bind.clone(),
            upstream: Some(settings.engine_bind()),
            allow_direct_fallback: settings.direct_fallback,
        }));
        if let Err(e) = relay.start().await {
            self.status.set(Status {
                provider: self.kind.name().to_string(),
                message: format!("relay failed: {}", e),
                ..Default::default()
            });
            return Err(e);
        }
        if let Err(e) = persist_bind(&state_dir, &bind).await {
            warn!("Failed to persist relay bind {}: {}", bind, e);
        }

        let mode = request.integration();
        let integration = match apply_integration(
            &self.deps,
            mode,
            &bind,
            &state_dir,
            self.deps.dns(request),
        )
        .await
        {
            Ok(integration) => integration,
            Err(e) => {
                if let Err(stop_err) = relay.stop().await {
                    warn!("Failed to stop relay: {}", stop_err);
                }
                self.status.set(Status {
                    provider: self.kind.name().to_string(),
                    message: e.to_string(),
                    ..Default::default()
                });
                return Err(e);
            }
        };

        let message = match &integration.warning {
            Some(w) => format!("{} ({})", MSG_WARMING, w),
            None => MSG_WARMING.to_string(),
        };
        self.status.set(Status {
            connected: true,
            provider: self.kind.name().to_string(),
            exit_country: request.exit_country().map(str::to_string),
            message,
            integration: mode.as_str().to_string(),
            bind: bind.clone(),
            pac_enabled: integration.pac_enabled,
            virtualization_active: integration.virtualization_active(),
            ..Default::default()
        });
        info!("{} relay listening on {}", self.kind, bind);

        let base = self
            .deps
            .tunnel_config(self.kind, request, &state_dir, settings.engine_bind());
        let urls = candidate_test_urls(request.option("testURL"), settings);
        let log_path = state_dir.join(ENGINE_LOG_FILE);
        let log_offset = file_len(&log_path).await;

        let cancel = CancellationToken::new();
        let engine: EngineSlot = Arc::new(Mutex::new(None));
        let task = SearchTask {
            search: self.search(&base.bin),
            base,
            urls,
            cancel: cancel.clone(),
            status: self.status.clone(),
            engine: engine.clone(),
            log_path,
            log_offset,
        };
        let handle = tokio::spawn(task.run());

        *slot = Some(Session {
            relay,
            integration,
            cancel,
            search: Some(handle),
            engine,
        });
        Ok(self.status.get())
    }

    async fn disconnect(&self) -> Result<()> {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            info!("Disconnecting {}", self.kind);
            Self::teardown(session).await;
        }
        self.status.set(Status::default());
        Ok(())
    }

    fn status(&self) -> Status {
        self.status.get()
    }
}

/// Background half of a session
struct SearchTask {
    search: CandidateSearch,
    base: TunnelConfig,
    urls: Vec<String>,
    cancel: CancellationToken,
    status: StatusCell,
    engine: EngineSlot,
    log_path: PathBuf,
    log_offset: u64,
}

impl SearchTask {
    async fn run(self) {
        let watcher = tokio::spawn(watch_handshake(
            self.log_path.clone(),
            self.log_offset,
            self.status.clone(),
            self.cancel.child_token(),
        ));

        let outcome = self.search.run(&self.base, &self.urls, &self.cancel).await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(Error::Cancelled) => {
                debug!("Candidate search cancelled");
                watcher.abort();
                return;
            }
            Err(e) => {
                warn!("Tunnel search failed: {}", e);
                watcher.abort();
                self.status
                    .update(|s| s.message = format!("relay active; tunnel pending: {}", e));
                return;
            }
        };

        info!(
            "Tunnel engine up after {} start(s) ({})",
            outcome.starts,
            outcome.describe()
        );
        let bind = outcome.engine.bind().to_string();
        {
            let mut slot = self.engine.lock().await;
            if self.cancel.is_cancelled() {
                // disconnect raced the winning attempt
                if let Err(e) = outcome.engine.stop().await {
                    warn!("Failed to stop tunnel engine: {}", e);
                }
                return;
            }
            *slot = Some(outcome.engine);
        }

        let ready = tokio::select! {
            res = wait_port(&bind, ACTIVE_WAIT) => res,
            _ = self.cancel.cancelled() => return,
        };
        watcher.abort();
        match ready {
            Ok(()) => self.status.update(|s| s.message = MSG_ACTIVE.to_string()),
            Err(e) => {
                warn!("Tunnel engine port never answered: {}", e);
                return;
            }
        }

        self.monitor().await;
    }

    /// Surface an engine exit in the status until the session ends
    async fn monitor(&self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep(HEALTH_POLL) => {}
            }
            let exited = {
                let slot = self.engine.lock().await;
                match slot.as_ref() {
                    Some(engine) if !engine.is_active() => Some(engine.last_error()),
                    Some(_) => None,
                    None => return,
                }
            };
            if let Some(last_error) = exited {
                let reason = last_error.unwrap_or_else(|| "tunnel engine stopped".to_string());
                warn!("Tunnel engine exited: {}", reason);
                self.status
                    .update(|s| s.message = format!("relay active; tunnel exited: {}", reason));
                return;
            }
        }
    }
}

async fn file_len(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

/// Bytes appended to `path` after `offset`
async fn read_from(path: &Path, offset: u64) -> Option<String> {
    let mut file = tokio::fs::File::open(path).await.ok()?;
    let len = file.metadata().await.ok()?.len();
    // truncated or rotated since the session began
    let offset = if len < offset { 0 } else { offset };
    file.seek(std::io::SeekFrom::Start(offset)).await.ok()?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await.ok()?;
    Some(String::from_utf8_lossy(&buf).into_owned())
}

/// Poll the engine log for a completed handshake while the tunnel warms up
async fn watch_handshake(
    path: PathBuf,
    offset: u64,
    status: StatusCell,
    cancel: CancellationToken,
) {
    let deadline = Instant::now() + HANDSHAKE_WINDOW;
    while Instant::now() < deadline {
        if let Some(text) = read_from(&path, offset).await {
            if text.contains(HANDSHAKE_MARKER) {
                let changed = status.update_if(|s| {
                    if s.message.starts_with(MSG_WARMING) {
                        s.message = MSG_HANDSHAKE.to_string();
                        true
                    } else {
                        false
                    }
                });
                if changed {
                    debug!("Engine reported handshake complete");
                }
                return;
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(HANDSHAKE_POLL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SearchLimits, Settings};
    use crate::engine::{Endpoint, EndpointScan};
    use crate::process::mock::MockRunner;
    use crate::system::UnsupportedSystemProxy;
    use tokio::io::AsyncWriteExt;

    struct NoEndpoints;

    #[async_trait]
    impl EndpointScan for NoEndpoints {
        async fn scan(&self) -> Result<Vec<Endpoint>> {
            Ok(Vec::new())
        }
    }

    fn free_port() -> u16 {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    }

    fn provider(runner: MockRunner) -> (TunnelProvider, PathBuf) {
        let dir = std::env::temp_dir().join(format!("tk-fallback-{}", uuid::Uuid::new_v4()));
        let settings = Settings {
            state_dir: dir.clone(),
            engine_port: free_port(),
            search: SearchLimits {
                probe_timeout_ms: 300,
                scan_timeout_ms: 100,
                max_endpoints: 15,
                max_scan_urls: 3,
            },
            ..Default::default()
        };
        let deps = ProviderDeps {
            settings: Arc::new(settings),
            runner: Arc::new(runner),
            scanner: Some(Arc::new(NoEndpoints)),
            system_proxy: Arc::new(UnsupportedSystemProxy),
        };
        (TunnelProvider::new(ProviderKind::FallbackSearch, deps), dir)
    }

    fn request() -> ConnectRequest {
        let bind = format!("127.0.0.1:{}", free_port());
        ConnectRequest::new("warp")
            .with_option("bind", bind)
            .with_option("testURL", "http://probe/")
    }

    async fn wait_for_message<F: Fn(&str) -> bool>(cell: &StatusCell, pred: F) -> String {
        let mut rx = cell.subscribe();
        let wait = async {
            loop {
                let message = rx.borrow_and_update().message.clone();
                if pred(&message) {
                    return message;
                }
                if rx.changed().await.is_err() {
                    return message;
                }
            }
        };
        timeout(Duration::from_secs(10), wait).await.unwrap()
    }

    #[tokio::test]
    async fn test_connect_returns_while_warming() {
        let runner = MockRunner::new().listen_when(|_| true);
        let (provider, _dir) = provider(runner.clone());

        let status = provider.connect(&request()).await.unwrap();
        assert!(status.connected);
        assert_eq!(status.provider, "warp");
        assert_eq!(status.integration, "direct");
        assert!(status.message.starts_with("connected"));

        let message = wait_for_message(provider.status_cell(), |m| m == MSG_ACTIVE).await;
        assert_eq!(message, MSG_ACTIVE);
        assert_eq!(
            runner.started()[0].arg_value("--test-url"),
            Some("http://probe/")
        );

        provider.disconnect().await.unwrap();
        assert_eq!(provider.status(), Status::default());
        assert_eq!(runner.processes()[0].kill_count(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_search_keeps_relay() {
        let runner = MockRunner::new();
        let (provider, _dir) = provider(runner);

        let status = provider.connect(&request()).await.unwrap();
        let bind = status.bind.clone();
        let message = wait_for_message(provider.status_cell(), |m| {
            m.starts_with("relay active; tunnel pending")
        })
        .await;
        assert!(message.contains("timeout waiting for"));
        assert!(provider.status().connected);
        assert!(crate::common::net::probe_tcp(&bind, Duration::from_millis(500)).await);

        provider.disconnect().await.unwrap();
        assert!(!crate::common::net::probe_tcp(&bind, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_engine_exit_surfaces_in_status() {
        let runner = MockRunner::new().listen_when(|_| true);
        let (provider, _dir) = provider(runner.clone());
        provider.connect(&request()).await.unwrap();
        wait_for_message(provider.status_cell(), |m| m == MSG_ACTIVE).await;

        runner.processes()[0].exit(Err("exit status: 1".into()));
        let message =
            wait_for_message(provider.status_cell(), |m| m.contains("tunnel exited")).await;
        assert!(message.contains("exit status: 1"));
        provider.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_seen_only_after_session_start() {
        let dir = std::env::temp_dir().join(format!("tk-hs-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let log = dir.join(ENGINE_LOG_FILE);
        tokio::fs::write(&log, b"old run: handshake complete\n").await.unwrap();

        let status = StatusCell::new(Status {
            message: MSG_WARMING.into(),
            ..Default::default()
        });
        let offset = file_len(&log).await;
        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(watch_handshake(
            log.clone(),
            offset,
            status.clone(),
            cancel.clone(),
        ));

        sleep(Duration::from_millis(200)).await;
        assert_eq!(status.get().message, MSG_WARMING);

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&log)
            .await
            .unwrap();
        file.write_all(b"handshake complete\n").await.unwrap();
        file.flush().await.unwrap();

        let message = wait_for_message(&status, |m| m == MSG_HANDSHAKE).await;
        assert_eq!(message, MSG_HANDSHAKE);
        timeout(Duration::from_secs(1), watcher).await.unwrap().unwrap();
    }
}
