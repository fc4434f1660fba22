//! Endpoint scanning through `warp-plus --scan`

use crate::{Error, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

/// Upper bound for a whole scan run
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(90);

static ENDPOINT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9.]+:[0-9]+)(?:\s+(\d+))?$").expect("endpoint regex is valid")
});

/// A candidate tunnel endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    /// `ip:port`
    pub address: String,
    /// Quality metric reported by the scanner, 0 when absent
    pub score: u32,
}

/// Source of fallback endpoints
#[async_trait]
pub trait EndpointScan: Send + Sync {
    async fn scan(&self) -> Result<Vec<Endpoint>>;
}

/// Runs the tunnel engine binary in scan mode
#[derive(Debug, Clone)]
pub struct WarpScanner {
    bin: String,
    limit: Duration,
}

impl WarpScanner {
    pub fn new(bin: impl Into<String>) -> Self {
        WarpScanner {
            bin: bin.into(),
            limit: SCAN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.limit = limit;
        self
    }
}

#[async_trait]
impl EndpointScan for WarpScanner {
    async fn scan(&self) -> Result<Vec<Endpoint>> {
        info!("Scanning endpoints with {} --scan", self.bin);
        let output = Command::new(&self.bin)
            .arg("--scan")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = timeout(self.limit, output)
            .await
            .map_err(|_| Error::timeout(format!("{} --scan", self.bin)))?
            .map_err(|e| Error::spawn_failed(self.bin.clone(), e))?;

        let endpoints = parse_scan_output(&String::from_utf8_lossy(&output.stdout));
        debug!("Scan produced {} endpoints", endpoints.len());
        Ok(endpoints)
    }
}

/// Pick `ip:port [score]` lines out of scanner output
pub fn parse_scan_output(output: &str) -> Vec<Endpoint> {
    output
        .lines()
        .filter_map(|line| ENDPOINT_LINE.captures(line.trim_end_matches('\r')))
        .map(|caps| Endpoint {
            address: caps[1].to_string(),
            score: caps
                .get(2)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0),
        })
        .collect()
}
