//! Request and status types shared by the manager, providers and the control API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

/// Option key the manager injects with the effective state directory
pub const OPTION_STATE_DIR: &str = "stateDir";

/// Connect request as submitted by a client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl ConnectRequest {
    pub fn new(provider: impl Into<String>) -> Self {
        ConnectRequest {
            provider: provider.into(),
            ..Default::default()
        }
    }

    pub fn with_option(mut self, key: &str, value: impl Into<String>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    /// Trimmed option value, `None` when missing or blank
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// `server[:port]` when a server was given
    pub fn endpoint(&self) -> Option<String> {
        let server = self.server.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        Some(match self.port {
            Some(port) if port != 0 => crate::common::net::join_host_port(server, port),
            _ => server.to_string(),
        })
    }

    pub fn integration(&self) -> IntegrationMode {
        IntegrationMode::parse(self.option("integration").unwrap_or_default())
    }

    pub fn state_dir(&self) -> Option<PathBuf> {
        self.option(OPTION_STATE_DIR).map(PathBuf::from)
    }

    pub fn exit_country(&self) -> Option<&str> {
        self.exit_country
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

/// How client traffic reaches the relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationMode {
    /// Applications point at the relay themselves
    #[default]
    Direct,
    /// System proxy auto-config
    Pac,
    /// Virtualized interface
    Tun,
}

impl IntegrationMode {
    /// Unrecognised values mean direct
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "pac" => IntegrationMode::Pac,
            "tun" => IntegrationMode::Tun,
            _ => IntegrationMode::Direct,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationMode::Direct => "direct",
            IntegrationMode::Pac => "pac",
            IntegrationMode::Tun => "tun",
        }
    }
}

impl fmt::Display for IntegrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the session as reported to clients
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_country: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub integration: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bind: String,
    #[serde(default)]
    pub pac_enabled: bool,
    #[serde(default)]
    pub virtualization_active: bool,
}

impl Status {
    /// Disconnected status carrying only a message
    pub fn with_message(message: impl Into<String>) -> Self {
        Status {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Single-writer status cell.
///
/// Every change replaces the whole snapshot, so readers never observe a
/// half-applied transition.
#[derive(Clone)]
pub struct StatusCell {
    tx: Arc<watch::Sender<Status>>,
}

impl StatusCell {
    pub fn new(initial: Status) -> Self {
        let (tx, _) = watch::channel(initial);
        StatusCell { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> Status {
        self.tx.borrow().clone()
    }

    pub fn set(&self, status: Status) {
        self.tx.send_replace(status);
    }

    pub fn update<F: FnOnce(&mut Status)>(&self, f: F) {
        self.tx.send_modify(f);
    }

    /// Apply `f` and notify only when it reports a change
    pub fn update_if<F: FnOnce(&mut Status) -> bool>(&self, f: F) -> bool {
        self.tx.send_if_modified(f)
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.tx.subscribe()
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new(Status::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_json() {
        let json = r#"{"provider":"warp","exitCountry":"DE","server":"162.159.192.1","port":2408,
                       "options":{"bind":" 127.0.0.1:8088 ","integration":"PAC","key":""}}"#;
        let req: ConnectRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.exit_country(), Some("DE"));
        assert_eq!(req.option("bind"), Some("127.0.0.1:8088"));
        assert_eq!(req.option("key"), None);
        assert_eq!(req.endpoint().as_deref(), Some("162.159.192.1:2408"));
        assert_eq!(req.integration(), IntegrationMode::Pac);

        let minimal: ConnectRequest = serde_json::from_str(r#"{"provider":"gool"}"#).unwrap();
        assert!(minimal.endpoint().is_none());
        assert_eq!(minimal.integration(), IntegrationMode::Direct);
    }

    #[test]
    fn test_unknown_integration_is_direct() {
        assert_eq!(IntegrationMode::parse("bogus"), IntegrationMode::Direct);
        assert_eq!(IntegrationMode::parse(" tun "), IntegrationMode::Tun);
    }

    #[test]
    fn test_status_json_is_camel_case() {
        let status = Status {
            connected: true,
            provider: "warp".into(),
            bind: "127.0.0.1:8087".into(),
            pac_enabled: true,
            ..Default::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["pacEnabled"], true);
        assert_eq!(value["virtualizationActive"], false);
        assert!(value.get("since").is_none());
        assert!(value.get("exitIp").is_none());
    }

    #[tokio::test]
    async fn test_status_cell_notifies() {
        let cell = StatusCell::default();
        let mut rx = cell.subscribe();
        cell.update(|s| s.message = "warming".into());
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().message, "warming");

        assert!(!cell.update_if(|_| false));
        assert!(!rx.has_changed().unwrap());
        cell.set(Status::with_message("done"));
        assert_eq!(cell.get().message, "done");
    }
}
