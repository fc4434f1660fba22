//! Public relay bind selection and persistence

use crate::common::net::{is_bindable, join_host_port};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const BIND_FILE: &str = "socks-bind.json";

/// `{"bind": "host:port"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindRecord {
    pub bind: String,
}

pub fn bind_path(state_dir: &Path) -> PathBuf {
    state_dir.join(BIND_FILE)
}

/// Last persisted bind, `None` when missing, unreadable or empty
pub async fn load_bind(state_dir: &Path) -> Option<String> {
    let content = tokio::fs::read(bind_path(state_dir)).await.ok()?;
    let record: BindRecord = serde_json::from_slice(&content).ok()?;
    let bind = record.bind.trim();
    (!bind.is_empty()).then(|| bind.to_string())
}

pub async fn persist_bind(state_dir: &Path, bind: &str) -> Result<()> {
    let record = BindRecord {
        bind: bind.to_string(),
    };
    tokio::fs::write(bind_path(state_dir), serde_json::to_vec(&record)?).await?;
    Ok(())
}

/// Pick the relay listen address.
///
/// Order: the requested bind, the persisted bind, then the first free port
/// of `range` on loopback. Candidates on `reserved_port` are never returned
/// since the tunnel engine owns that port.
pub async fn choose_public_bind(
    state_dir: &Path,
    requested: Option<&str>,
    reserved_port: u16,
    range: RangeInclusive<u16>,
) -> Result<String> {
    let reserved_suffix = format!(":{}", reserved_port);
    let usable = |addr: &str| !addr.is_empty() && !addr.ends_with(&reserved_suffix);

    if let Some(addr) = requested.map(str::trim) {
        if usable(addr) && is_bindable(addr).await {
            return Ok(addr.to_string());
        }
        debug!("Requested bind {} not usable", addr);
    }

    if let Some(addr) = load_bind(state_dir).await {
        if usable(&addr) && is_bindable(&addr).await {
            return Ok(addr);
        }
        debug!("Persisted bind {} not usable", addr);
    }

    for port in range.clone() {
        if port == reserved_port {
            continue;
        }
        let addr = join_host_port("127.0.0.1", port);
        if is_bindable(&addr).await {
            return Ok(addr);
        }
    }

    Err(Error::BindUnavailable(format!(
        "no available port in {}-{}",
        range.start(),
        range.end()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tk-bind-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn free_port() -> u16 {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    }

    fn free_addr() -> String {
        format!("127.0.0.1:{}", free_port())
    }

    #[tokio::test]
    async fn test_requested_bind_wins() {
        let dir = temp_dir();
        let addr = free_addr();
        let port = free_port();
        let chosen = choose_public_bind(&dir, Some(&addr), 8086, port..=port)
            .await
            .unwrap();
        assert_eq!(chosen, addr);
    }

    #[tokio::test]
    async fn test_reserved_port_skipped() {
        let dir = temp_dir();
        let reserved = free_port();
        let fallback = free_port();

        let requested = format!("127.0.0.1:{}", reserved);
        persist_bind(&dir, &requested).await.unwrap();
        let chosen = choose_public_bind(&dir, Some(&requested), reserved, fallback..=fallback)
            .await
            .unwrap();
        assert_eq!(chosen, format!("127.0.0.1:{}", fallback));

        // the reserved port is skipped even inside the range
        let err = choose_public_bind(&dir, None, reserved, reserved..=reserved)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BindUnavailable(_)));
    }

    #[tokio::test]
    async fn test_persisted_bind_reused() {
        let dir = temp_dir();
        let addr = free_addr();
        persist_bind(&dir, &addr).await.unwrap();
        assert_eq!(load_bind(&dir).await.as_deref(), Some(addr.as_str()));

        let raw = std::fs::read_to_string(bind_path(&dir)).unwrap();
        assert_eq!(raw, format!("{{\"bind\":\"{}\"}}", addr));

        let port = free_port();
        let chosen = choose_public_bind(&dir, None, 8086, port..=port).await.unwrap();
        assert_eq!(chosen, addr);
    }

    #[tokio::test]
    async fn test_busy_persisted_bind_ignored() {
        let dir = temp_dir();
        let busy = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = busy.local_addr().unwrap().to_string();
        persist_bind(&dir, &addr).await.unwrap();

        let port = free_port();
        let chosen = choose_public_bind(&dir, None, 8086, port..=port).await.unwrap();
        assert_eq!(chosen, format!("127.0.0.1:{}", port));
        drop(busy);
    }

    #[tokio::test]
    async fn test_exhausted_range_is_bind_unavailable() {
        let dir = temp_dir();
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let err = choose_public_bind(&dir, None, 8086, port..=port)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BindUnavailable(ref m) if m.contains(&port.to_string())));
    }

    #[tokio::test]
    async fn test_garbage_record_ignored() {
        let dir = temp_dir();
        std::fs::write(bind_path(&dir), b"not json").unwrap();
        assert!(load_bind(&dir).await.is_none());
        std::fs::write(bind_path(&dir), br#"{"bind":""}"#).unwrap();
        assert!(load_bind(&dir).await.is_none());
    }
}
