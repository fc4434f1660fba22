//! End-to-end candidate verification for the `gool` provider

use crate::outbound::http_get_via;
use crate::search::CandidateCheck;
use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

pub const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetches the probe URL through the candidate engine and expects a 2xx or 3xx.
///
/// Only plain `http://` URLs are fetched; anything else is accepted on the
/// open port alone.
pub struct HttpProbeCheck {
    limit: Duration,
}

impl HttpProbeCheck {
    pub fn new() -> Self {
        HttpProbeCheck {
            limit: VERIFY_TIMEOUT,
        }
    }

    pub fn with_timeout(limit: Duration) -> Self {
        HttpProbeCheck { limit }
    }
}

impl Default for HttpProbeCheck {
    fn default() -> Self {
        Self::new()
    }
}

/// Host and path of a plain `http://` URL
pub fn split_http_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("http://")?;
    let (host, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    // the dialer always targets port 80
    let host = host.split(':').next().unwrap_or(host);
    (!host.is_empty()).then_some((host, path))
}

/// Whether an HTTP status line carries a 2xx or 3xx code
pub fn status_ok(status_line: &str) -> bool {
    status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .map_or(false, |code| (200..400).contains(&code))
}

#[async_trait]
impl CandidateCheck for HttpProbeCheck {
    async fn verify(&self, socks_addr: &str, probe_url: &str) -> Result<()> {
        let Some((host, path)) = split_http_url(probe_url) else {
            return Ok(());
        };

        let (status, _) = timeout(self.limit, http_get_via(socks_addr, host, path, 512))
            .await
            .map_err(|_| Error::timeout(format!("verifying {} via {}", probe_url, socks_addr)))??;
        debug!("Probe {} via {}: {}", probe_url, socks_addr, status);

        if status_ok(&status) {
            Ok(())
        } else {
            Err(Error::protocol(format!("probe {} answered {:?}", probe_url, status)))
        }
    }
}
