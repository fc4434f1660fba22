//! Session manager
//!
//! Holds at most one active provider. Connect resolves the provider, makes
//! sure a device identity exists, tears down whatever was active and hands
//! the request (with the state directory injected) to the new provider.

mod types;

pub use types::{ConnectRequest, IntegrationMode, Status, StatusCell, OPTION_STATE_DIR};

use crate::config::Settings;
use crate::identity::IdentityStore;
use crate::provider::{registry, Provider, ProviderDeps, ProviderKind};
use crate::{Error, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Default)]
struct State {
    active: Option<Arc<dyn Provider>>,
    status: Status,
}

pub struct Manager {
    settings: Arc<Settings>,
    identity: Arc<dyn IdentityStore>,
    providers: HashMap<ProviderKind, Arc<dyn Provider>>,
    state: RwLock<State>,
}

impl Manager {
    pub fn new(deps: ProviderDeps, identity: Arc<dyn IdentityStore>) -> Self {
        let providers = registry(&deps);
        Self::with_providers(deps.settings, identity, providers)
    }

    pub fn with_providers(
        settings: Arc<Settings>,
        identity: Arc<dyn IdentityStore>,
        providers: HashMap<ProviderKind, Arc<dyn Provider>>,
    ) -> Self {
        Manager {
            settings,
            identity,
            providers,
            state: RwLock::new(State::default()),
        }
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn identity_store(&self) -> &Arc<dyn IdentityStore> {
        &self.identity
    }

    /// State directory used when a request does not name one
    pub fn state_dir(&self) -> PathBuf {
        self.settings.state_dir.clone()
    }

    pub async fn connect(&self, request: ConnectRequest) -> Result<Status> {
        let mut state = self.state.write().await;

        let kind: ProviderKind = request.provider.parse()?;
        let provider = self
            .providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::UnknownProvider(request.provider.clone()))?;

        let state_dir = request.state_dir().unwrap_or_else(|| self.state_dir());
        if let Err(e) = self.identity.ensure_identity(&state_dir).await {
            let err = match e {
                e @ Error::RegistrationFailed(_) => e,
                other => Error::RegistrationFailed(other.to_string()),
            };
            state.status = Status {
                provider: kind.name().to_string(),
                message: err.to_string(),
                ..Default::default()
            };
            return Err(err);
        }

        if let Some(previous) = state.active.take() {
            info!("Replacing active {} session", previous.kind());
            if let Err(e) = previous.disconnect().await {
                warn!("Failed to disconnect {}: {}", previous.kind(), e);
            }
        }

        let mut request = request;
        request.options.insert(
            OPTION_STATE_DIR.to_string(),
            state_dir.display().to_string(),
        );

        match provider.connect(&request).await {
            Ok(mut status) => {
                status.since = Some(Utc::now());
                info!("{} connected: {}", kind, status.message);
                state.active = Some(provider);
                state.status = status.clone();
                Ok(status)
            }
            Err(e) => {
                warn!("{} connect failed: {}", kind, e);
                let mut status = provider.status();
                status.connected = false;
                status.provider = kind.name().to_string();
                status.message = e.to_string();
                state.status = status;
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self) -> Status {
        let mut state = self.state.write().await;
        if let Some(provider) = state.active.take() {
            info!("Disconnecting {}", provider.kind());
            if let Err(e) = provider.disconnect().await {
                warn!("Failed to disconnect {}: {}", provider.kind(), e);
            }
        }
        state.status = Status::default();
        state.status.clone()
    }

    pub async fn status(&self) -> Status {
        let state = self.state.read().await;
        match &state.active {
            Some(provider) => {
                let mut status = provider.status();
                if status.since.is_none() {
                    status.since = state.status.since;
                }
                status
            }
            None => state.status.clone(),
        }
    }

    /// Kind of the active provider
    pub async fn active(&self) -> Option<ProviderKind> {
        self.state.read().await.active.as_ref().map(|p| p.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::Path;

    struct StaticIdentity {
        fail: bool,
        calls: Mutex<Vec<PathBuf>>,
    }

    impl StaticIdentity {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(StaticIdentity {
                fail,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl IdentityStore for StaticIdentity {
        async fn ensure_identity(&self, state_dir: &Path) -> Result<Identity> {
            self.calls.lock().push(state_dir.to_path_buf());
            if self.fail {
                return Err(Error::RegistrationFailed("403 Forbidden".into()));
            }
            Ok(Identity {
                device_id: "dev".into(),
                ..Default::default()
            })
        }

        async fn load(&self, _state_dir: &Path) -> Result<Option<Identity>> {
            Ok(None)
        }

        async fn reset(&self, _state_dir: &Path) -> Result<()> {
            Ok(())
        }
    }

    /// Provider recording the calls it receives
    struct FakeProvider {
        kind: ProviderKind,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
        status: StatusCell,
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn connect(&self, request: &ConnectRequest) -> Result<Status> {
            self.log.lock().push(format!(
                "connect {} {}",
                self.kind,
                request.option(OPTION_STATE_DIR).unwrap_or("-")
            ));
            if self.fail {
                return Err(Error::ReadinessTimeout("127.0.0.1:8086".into()));
            }
            self.status.set(Status {
                connected: true,
                provider: self.kind.name().into(),
                message: "connected".into(),
                ..Default::default()
            });
            Ok(self.status.get())
        }

        async fn disconnect(&self) -> Result<()> {
            self.log.lock().push(format!("disconnect {}", self.kind));
            self.status.set(Status::default());
            Ok(())
        }

        fn status(&self) -> Status {
            self.status.get()
        }
    }

    fn manager(
        identity: Arc<StaticIdentity>,
        failing: Option<ProviderKind>,
    ) -> (Manager, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut providers: HashMap<ProviderKind, Arc<dyn Provider>> = HashMap::new();
        for kind in ProviderKind::ALL {
            providers.insert(
                kind,
                Arc::new(FakeProvider {
                    kind,
                    fail: failing == Some(kind),
                    log: log.clone(),
                    status: StatusCell::default(),
                }),
            );
        }
        let settings = Arc::new(Settings {
            state_dir: PathBuf::from("/var/lib/tk"),
            ..Default::default()
        });
        (Manager::with_providers(settings, identity, providers), log)
    }

    #[tokio::test]
    async fn test_disconnect_with_nothing_active() {
        let (manager, log) = manager(StaticIdentity::new(false), None);
        let status = manager.disconnect().await;
        assert_eq!(status, Status::default());
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let identity = StaticIdentity::new(false);
        let (manager, log) = manager(identity.clone(), None);
        let err = manager.connect(ConnectRequest::new("tor")).await.unwrap_err();
        assert!(matches!(err, Error::UnknownProvider(_)));
        assert!(identity.calls.lock().is_empty());
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_connect_injects_state_dir_and_stamps_since() {
        let (manager, log) = manager(StaticIdentity::new(false), None);
        let status = manager.connect(ConnectRequest::new("warp")).await.unwrap();
        assert!(status.connected);
        assert!(status.since.is_some());
        assert_eq!(*log.lock(), vec!["connect warp /var/lib/tk".to_string()]);
        assert_eq!(manager.active().await, Some(ProviderKind::FallbackSearch));
        assert_eq!(manager.status().await.since, status.since);
    }

    #[tokio::test]
    async fn test_switching_disconnects_previous() {
        let (manager, log) = manager(StaticIdentity::new(false), None);
        manager.connect(ConnectRequest::new("warp")).await.unwrap();
        manager
            .connect(ConnectRequest::new("psiphon").with_option(OPTION_STATE_DIR, "/tmp/p"))
            .await
            .unwrap();
        assert_eq!(
            *log.lock(),
            vec![
                "connect warp /var/lib/tk".to_string(),
                "disconnect warp".to_string(),
                "connect psiphon /tmp/p".to_string(),
            ]
        );
        assert_eq!(manager.active().await, Some(ProviderKind::Direct));
    }

    #[tokio::test]
    async fn test_registration_failure_blocks_connect() {
        let (manager, log) = manager(StaticIdentity::new(true), None);
        let err = manager.connect(ConnectRequest::new("gool")).await.unwrap_err();
        assert!(matches!(err, Error::RegistrationFailed(_)));
        assert!(log.lock().is_empty());
        let status = manager.status().await;
        assert!(!status.connected);
        assert!(status.message.starts_with("registration failed"));
    }

    #[tokio::test]
    async fn test_provider_error_recorded() {
        let (manager, _log) = manager(StaticIdentity::new(false), Some(ProviderKind::Direct));
        let err = manager.connect(ConnectRequest::new("psiphon")).await.unwrap_err();
        assert!(matches!(err, Error::ReadinessTimeout(_)));
        let status = manager.status().await;
        assert!(!status.connected);
        assert_eq!(status.message, "timeout waiting for 127.0.0.1:8086");
        assert_eq!(manager.active().await, None);
    }
}
