//! WARP device identity
//!
//! Tunnel engines need a registered device. The identity is created once
//! through a [`Registrar`] and kept in `<state-dir>/warp_identity.json`.

use crate::{Error, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use x25519_dalek::{PublicKey, StaticSecret};

/// Identity file name inside the state directory
pub const IDENTITY_FILE: &str = "warp_identity.json";

/// Cloudflare device registration endpoint
pub const DEFAULT_REGISTRATION_URL: &str = "https://api.cloudflareclient.com/v0a0/reg";

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(20);

/// Registered device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "id")]
    pub device_id: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account_id: String,
    /// Base64 X25519 private key
    pub private_key: String,
    /// Base64 X25519 public key
    pub public_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub license: String,
}

/// What the control API is allowed to show
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySummary {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    pub has_private_key: bool,
    pub has_token: bool,
    pub path: String,
}

impl IdentitySummary {
    pub fn new(identity: Option<&Identity>, path: &Path) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        IdentitySummary {
            exists: identity.is_some(),
            device_id: identity.and_then(|i| non_empty(&i.device_id)),
            account_id: identity.and_then(|i| non_empty(&i.account_id)),
            public_key: identity.and_then(|i| non_empty(&i.public_key)),
            has_private_key: identity.map_or(false, |i| !i.private_key.is_empty()),
            has_token: identity.map_or(false, |i| !i.token.is_empty()),
            path: path.display().to_string(),
        }
    }
}

pub fn identity_path(state_dir: &Path) -> PathBuf {
    state_dir.join(IDENTITY_FILE)
}

/// Persistent identity prerequisite for tunnel providers
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Load the stored identity or register and persist a new one
    async fn ensure_identity(&self, state_dir: &Path) -> Result<Identity>;

    /// Stored identity, `None` when absent
    async fn load(&self, state_dir: &Path) -> Result<Option<Identity>>;

    /// Forget the stored identity so the next connect registers again
    async fn reset(&self, state_dir: &Path) -> Result<()>;
}

/// Creates new device identities
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self) -> Result<Identity>;
}

/// Registers against the WARP API with a fresh X25519 key pair
pub struct WarpRegistrar {
    client: reqwest::Client,
    url: String,
}

impl WarpRegistrar {
    pub fn new() -> Result<Self> {
        Self::with_url(DEFAULT_REGISTRATION_URL)
    }

    pub fn with_url(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REGISTRATION_TIMEOUT)
            .user_agent("okhttp/3.12.1")
            .build()?;
        Ok(WarpRegistrar {
            client,
            url: url.into(),
        })
    }
}

#[derive(Serialize)]
struct RegistrationRequest<'a> {
    install_id: &'a str,
    key: &'a str,
    fcm_token: &'a str,
    model: &'a str,
    serial_number: String,
    locale: &'a str,
}

#[derive(Deserialize)]
struct RegistrationResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    token: String,
    #[serde(default)]
    account: Option<RegisteredAccount>,
}

#[derive(Deserialize)]
struct RegisteredAccount {
    #[serde(default)]
    id: String,
    #[serde(default)]
    license: String,
}

/// Fresh X25519 key pair as (private, public) base64
pub fn generate_key_pair() -> (String, String) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (
        BASE64.encode(secret.to_bytes()),
        BASE64.encode(public.as_bytes()),
    )
}

#[async_trait]
impl Registrar for WarpRegistrar {
    async fn register(&self) -> Result<Identity> {
        let (private_key, public_key) = generate_key_pair();
        let body = RegistrationRequest {
            install_id: "",
            key: &public_key,
            fcm_token: "",
            model: "tunnelkeeper",
            serial_number: format!("tk-{}", uuid::Uuid::new_v4()),
            locale: "en_US",
        };

        debug!("Registering device at {}", self.url);
        let resp = self.client.post(&self.url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::RegistrationFailed(format!("{}: {}", status, text.trim())));
        }

        let reg: RegistrationResponse = resp.json().await?;
        if reg.id.is_empty() || reg.token.is_empty() {
            return Err(Error::RegistrationFailed("invalid registration response".into()));
        }
        let account = reg.account.unwrap_or(RegisteredAccount {
            id: String::new(),
            license: String::new(),
        });

        Ok(Identity {
            device_id: reg.id,
            token: reg.token,
            account_id: account.id,
            private_key,
            public_key,
            license: account.license,
        })
    }
}

/// JSON file store
pub struct FileIdentityStore {
    registrar: Arc<dyn Registrar>,
}

impl FileIdentityStore {
    pub fn new(registrar: Arc<dyn Registrar>) -> Self {
        FileIdentityStore { registrar }
    }

    async fn persist(&self, state_dir: &Path, identity: &Identity) -> Result<()> {
        tokio::fs::create_dir_all(state_dir).await?;
        let path = identity_path(state_dir);
        tokio::fs::write(&path, serde_json::to_vec_pretty(identity)?).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for FileIdentityStore {
    async fn ensure_identity(&self, state_dir: &Path) -> Result<Identity> {
        // an unreadable file is treated like a missing one and replaced
        if let Ok(Some(identity)) = self.load(state_dir).await {
            return Ok(identity);
        }

        let identity = self.registrar.register().await?;
        self.persist(state_dir, &identity).await?;
        info!("Registered new device {}", identity.device_id);
        Ok(identity)
    }

    async fn load(&self, state_dir: &Path) -> Result<Option<Identity>> {
        let content = match tokio::fs::read(identity_path(state_dir)).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let identity: Identity = serde_json::from_slice(&content)?;
        Ok((!identity.device_id.is_empty()).then_some(identity))
    }

    async fn reset(&self, state_dir: &Path) -> Result<()> {
        match tokio::fs::remove_file(identity_path(state_dir)).await {
            Ok(()) => {
                info!("Device identity removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
