//! Operating-system proxy settings

use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// System-wide proxy auto-config switch
#[async_trait]
pub trait SystemProxy: Send + Sync {
    async fn enable_pac(&self, url: &str) -> Result<()>;
    async fn disable_pac(&self) -> Result<()>;
}

/// Proxy control on platforms without an implementation
pub struct UnsupportedSystemProxy;

#[async_trait]
impl SystemProxy for UnsupportedSystemProxy {
    async fn enable_pac(&self, _url: &str) -> Result<()> {
        Err(Error::unsupported("system proxy is only available on macOS"))
    }

    async fn disable_pac(&self) -> Result<()> {
        Err(Error::unsupported("system proxy is only available on macOS"))
    }
}

/// macOS `networksetup` driver, applied to every enabled network service
pub struct MacSystemProxy {
    tool: String,
}

impl MacSystemProxy {
    pub fn new() -> Self {
        MacSystemProxy {
            tool: "networksetup".to_string(),
        }
    }

    pub fn with_tool(tool: impl Into<String>) -> Self {
        MacSystemProxy { tool: tool.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!("{} {}", self.tool, args.join(" "));
        let out = Command::new(&self.tool)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::spawn_failed(self.tool.clone(), e))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(Error::internal(format!(
                "{} {}: {}",
                self.tool,
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    async fn services(&self) -> Result<Vec<String>> {
        let listing = self.run(&["-listallnetworkservices"]).await?;
        Ok(parse_services(&listing))
    }

    async fn for_each_service(&self, apply: &[&[&str]]) -> Result<()> {
        let services = self.services().await?;
        if services.is_empty() {
            return Err(Error::internal("no network services found"));
        }

        let mut last_err = None;
        for service in &services {
            for args in apply {
                let mut argv = vec![args[0], service.as_str()];
                argv.extend_from_slice(&args[1..]);
                if let Err(e) = self.run(&argv).await {
                    warn!("Proxy setting failed for {}: {}", service, e);
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for MacSystemProxy {
    fn default() -> Self {
        Self::new()
    }
}

/// Service names from `networksetup -listallnetworkservices`.
///
/// The first line is an explanatory header; disabled services carry a
/// leading `*`.
pub fn parse_services(listing: &str) -> Vec<String> {
    listing
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('*'))
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl SystemProxy for MacSystemProxy {
    async fn enable_pac(&self, url: &str) -> Result<()> {
        self.for_each_service(&[
            &["-setautoproxyurl", url],
            &["-setautoproxystate", "on"],
        ])
        .await?;
        info!("System PAC enabled: {}", url);
        Ok(())
    }

    async fn disable_pac(&self) -> Result<()> {
        self.for_each_service(&[&["-setautoproxystate", "off"]])
            .await?;
        info!("System PAC disabled");
        Ok(())
    }
}

/// Implementation for the current platform
pub fn platform_default() -> Arc<dyn SystemProxy> {
    if cfg!(target_os = "macos") {
        Arc::new(MacSystemProxy::new())
    } else {
        Arc::new(UnsupportedSystemProxy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_services() {
        let listing = "An asterisk (*) denotes that a network service is disabled.\n\
                       Wi-Fi\n\
                       *Bluetooth PAN\n\
                       Thunderbolt Bridge\n\n";
        assert_eq!(parse_services(listing), vec!["Wi-Fi", "Thunderbolt Bridge"]);
        assert!(parse_services("header only\n").is_empty());
    }

    #[tokio::test]
    async fn test_unsupported() {
        let proxy = UnsupportedSystemProxy;
        assert!(matches!(
            proxy.enable_pac("http://127.0.0.1:4765/proxy.pac").await,
            Err(Error::Unsupported(_))
        ));
        assert!(proxy.disable_pac().await.is_err());
    }

    #[tokio::test]
    async fn test_missing_tool_is_spawn_failure() {
        let proxy = MacSystemProxy::with_tool("/nonexistent/networksetup");
        let err = proxy.disable_pac().await.unwrap_err();
        assert!(matches!(err, Error::SpawnFailed { .. }));
    }
}
