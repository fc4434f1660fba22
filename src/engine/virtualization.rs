//! `sing-box` TUN engine
//!
//! Captures system traffic into a TUN device and forwards all of it to the
//! relay's public SOCKS5 address. The routing config is regenerated into
//! `<state-dir>/singbox.json` before every spawn.

use super::supervisor::{EngineState, Supervisor};
use crate::common::net::split_host_port;
use crate::process::{CommandSpec, ProcessRunner};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// File name of the generated routing config
pub const CONFIG_FILE: &str = "singbox.json";

/// DNS server used when none is configured
pub const DEFAULT_DNS: &str = "https://1.1.1.1/dns-query";

const SOCKS_OUT_TAG: &str = "socks-out";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub log: LogSection,
    pub dns: DnsSection,
    pub inbounds: Vec<TunInbound>,
    pub outbounds: Vec<Outbound>,
    pub route: RouteSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsSection {
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunInbound {
    #[serde(rename = "type")]
    pub kind: String,
    pub inet4_address: String,
    pub auto_route: bool,
    pub strict_route: bool,
    pub stack: String,
    pub sniff: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Socks {
        tag: String,
        server: String,
        server_port: u16,
        version: String,
    },
    Direct {
        tag: String,
    },
    Block {
        tag: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSection {
    pub auto_route: bool,
    #[serde(rename = "final")]
    pub final_outbound: String,
}

impl RoutingConfig {
    /// TUN to SOCKS5 config forwarding everything to `socks_addr`
    pub fn new(socks_addr: &str, dns: Option<&str>) -> Result<Self> {
        let (server, server_port) = split_host_port(socks_addr)
            .ok_or_else(|| Error::config(format!("invalid socks address: {}", socks_addr)))?;
        let dns = dns
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or(DEFAULT_DNS);

        Ok(RoutingConfig {
            log: LogSection { disabled: true },
            dns: DnsSection {
                servers: vec![dns.to_string()],
            },
            inbounds: vec![TunInbound {
                kind: "tun".to_string(),
                inet4_address: "172.19.0.1/30".to_string(),
                auto_route: true,
                strict_route: false,
                stack: "gvisor".to_string(),
                sniff: true,
            }],
            outbounds: vec![
                Outbound::Socks {
                    tag: SOCKS_OUT_TAG.to_string(),
                    server,
                    server_port,
                    version: "5".to_string(),
                },
                Outbound::Direct {
                    tag: "direct".to_string(),
                },
                Outbound::Block {
                    tag: "block".to_string(),
                },
            ],
            route: RouteSection {
                auto_route: true,
                final_outbound: SOCKS_OUT_TAG.to_string(),
            },
        })
    }

    /// Host and port of the SOCKS outbound
    pub fn socks_outbound(&self) -> Option<(&str, u16)> {
        self.outbounds.iter().find_map(|o| match o {
            Outbound::Socks {
                server, server_port, ..
            } => Some((server.as_str(), *server_port)),
            _ => None,
        })
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Launch parameters
#[derive(Debug, Clone, Default)]
pub struct VirtualizationConfig {
    pub bin: String,
    /// Address of the relay the TUN traffic goes to
    pub socks_addr: String,
    pub state_dir: Option<PathBuf>,
    pub dns: Option<String>,
    pub log_path: Option<PathBuf>,
}

impl VirtualizationConfig {
    pub fn config_path(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|d| d.join(CONFIG_FILE))
    }

    /// `run -c <path>` for a binary named `sing-box`, `-c <path>` for helpers
    pub fn args(&self, config_path: &Path) -> Vec<String> {
        let file_name = Path::new(&self.bin)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let mut args = Vec::with_capacity(3);
        if file_name == "sing-box" || file_name == "sing-box.exe" {
            args.push("run".to_string());
        }
        args.push("-c".to_string());
        args.push(config_path.display().to_string());
        args
    }
}

/// Supervises one `sing-box` process
pub struct VirtualizationEngine {
    config: VirtualizationConfig,
    supervisor: Supervisor,
}

impl VirtualizationEngine {
    pub fn new(config: VirtualizationConfig, runner: Arc<dyn ProcessRunner>) -> Self {
        VirtualizationEngine {
            config,
            supervisor: Supervisor::new("sing-box", runner),
        }
    }

    pub async fn start(&self) -> Result<()> {
        if self.is_active() {
            return Ok(());
        }
        let state_dir = self
            .config
            .state_dir
            .as_ref()
            .ok_or_else(|| Error::config("virtualization engine needs a state directory"))?;
        tokio::fs::create_dir_all(state_dir).await?;

        let path = state_dir.join(CONFIG_FILE);
        RoutingConfig::new(&self.config.socks_addr, self.config.dns.as_deref())?.write_to(&path)?;
        debug!("Wrote routing config to {}", path.display());

        let spec = CommandSpec::new(self.config.bin.clone(), self.config.args(&path))
            .with_log(self.config.log_path.clone());
        self.supervisor.start(spec).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.supervisor.stop().await
    }

    pub fn is_active(&self) -> bool {
        self.supervisor.is_active()
    }

    pub fn state(&self) -> EngineState {
        self.supervisor.state()
    }

    pub fn last_error(&self) -> Option<String> {
        self.supervisor.last_error()
    }

    pub fn config(&self) -> &VirtualizationConfig {
        &self.config
    }
}
