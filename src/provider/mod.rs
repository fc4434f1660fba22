//! Tunnel providers
//!
//! A provider turns a [`ConnectRequest`] into a running session:
//!
//! - `warp` ([`ProviderKind::FallbackSearch`]): relay first, candidate search in the background
//! - `gool` ([`ProviderKind::DualProbe`]): same, with an end-to-end HTTP check per candidate
//! - `psiphon` ([`ProviderKind::Direct`]): the engine itself serves SOCKS, no relay

pub mod bind;
mod direct;
mod dual_probe;
mod fallback;
mod integration;

pub use direct::DirectProvider;
pub use dual_probe::HttpProbeCheck;
pub use fallback::TunnelProvider;
pub use integration::{apply_integration, Integration};

use crate::config::Settings;
use crate::engine::{EndpointScan, TunnelConfig, WarpScanner};
use crate::manager::{ConnectRequest, Status};
use crate::process::ProcessRunner;
use crate::system::SystemProxy;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Engine log file inside the state directory
pub const ENGINE_LOG_FILE: &str = "warp-plus.log";

/// Virtualization engine log file inside the state directory
pub const VIRTUALIZATION_LOG_FILE: &str = "sing-box.log";

/// Closed set of provider strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    FallbackSearch,
    DualProbe,
    Direct,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::FallbackSearch,
        ProviderKind::DualProbe,
        ProviderKind::Direct,
    ];

    /// Name clients use in requests
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::FallbackSearch => "warp",
            ProviderKind::DualProbe => "gool",
            ProviderKind::Direct => "psiphon",
        }
    }

    /// Tunnel engine mode
    pub fn mode(&self) -> &'static str {
        match self {
            ProviderKind::FallbackSearch => "warp",
            ProviderKind::DualProbe => "gool",
            ProviderKind::Direct => "psiphon",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warp" => Ok(ProviderKind::FallbackSearch),
            "gool" => Ok(ProviderKind::DualProbe),
            "psiphon" => Ok(ProviderKind::Direct),
            other => Err(Error::UnknownProvider(other.to_string())),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One upstream strategy
#[async_trait]
pub trait Provider: Send + Sync {
    /// Strategy implemented
    fn kind(&self) -> ProviderKind;

    /// Bring the session up. The request already carries `stateDir`.
    async fn connect(&self, request: &ConnectRequest) -> Result<Status>;

    /// Tear the session down; every step is best-effort
    async fn disconnect(&self) -> Result<()>;

    /// Current snapshot
    fn status(&self) -> Status;
}

/// Collaborators shared by every provider
#[derive(Clone)]
pub struct ProviderDeps {
    pub settings: Arc<Settings>,
    pub runner: Arc<dyn ProcessRunner>,
    /// Endpoint scanner; `None` runs `<bin> --scan`
    pub scanner: Option<Arc<dyn EndpointScan>>,
    pub system_proxy: Arc<dyn SystemProxy>,
}

impl ProviderDeps {
    pub fn scanner_for(&self, bin: &str) -> Arc<dyn EndpointScan> {
        match &self.scanner {
            Some(scanner) => scanner.clone(),
            None => Arc::new(WarpScanner::new(bin)),
        }
    }

    /// Request state directory, falling back to the configured one
    pub fn state_dir(&self, request: &ConnectRequest) -> PathBuf {
        request
            .state_dir()
            .unwrap_or_else(|| self.settings.state_dir.clone())
    }

    /// Engine launch parameters shared by every attempt of a session
    pub fn tunnel_config(
        &self,
        kind: ProviderKind,
        request: &ConnectRequest,
        state_dir: &Path,
        bind: String,
    ) -> TunnelConfig {
        let settings = &self.settings;
        TunnelConfig {
            bin: settings.warp_plus_bin(request.option("bin")),
            bind,
            mode: kind.mode().to_string(),
            country: request.exit_country().map(str::to_string),
            key: request.option("key").map(str::to_string),
            endpoint: request.endpoint(),
            cache_dir: Some(state_dir.to_path_buf()),
            log_path: Some(state_dir.join(ENGINE_LOG_FILE)),
            test_url: None,
            ipv4_only: settings.ipv4_only,
            ipv6_only: settings.ipv6_only,
            verbose: settings.verbose,
        }
    }

    /// DNS for the virtualization config: request option, then settings
    pub fn dns(&self, request: &ConnectRequest) -> Option<String> {
        request
            .option("dns")
            .map(str::to_string)
            .or_else(|| self.settings.dns.clone())
    }
}

/// One provider per kind, built once
pub fn registry(deps: &ProviderDeps) -> HashMap<ProviderKind, Arc<dyn Provider>> {
    let mut providers: HashMap<ProviderKind, Arc<dyn Provider>> = HashMap::new();
    providers.insert(
        ProviderKind::FallbackSearch,
        Arc::new(TunnelProvider::new(ProviderKind::FallbackSearch, deps.clone())),
    );
    providers.insert(
        ProviderKind::DualProbe,
        Arc::new(
            TunnelProvider::new(ProviderKind::DualProbe, deps.clone())
                .with_check(Arc::new(HttpProbeCheck::new())),
        ),
    );
    providers.insert(
        ProviderKind::Direct,
        Arc::new(DirectProvider::new(deps.clone())),
    );
    providers
}
