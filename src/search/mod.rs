//! Candidate search
//!
//! Finds a tunnel engine configuration that actually comes up. Two phases,
//! strictly sequential:
//!
//! 1. every probe URL in priority order, one engine run each
//! 2. if all of those failed, scanned endpoints crossed with the first few
//!    probe URLs
//!
//! The first run whose SOCKS port opens (and passes the optional
//! [`CandidateCheck`]) wins and is handed back still running. Every losing
//! run is stopped before the next one starts, so only one engine is alive
//! at a time.

use crate::common::net::wait_port;
use crate::config::{SearchLimits, Settings, DEFAULT_TEST_URLS};
use crate::engine::{EndpointScan, TunnelConfig, TunnelEngine};
use crate::process::ProcessRunner;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often a readiness wait checks whether the engine already died
const ENGINE_EXIT_POLL: Duration = Duration::from_millis(100);

/// Probe URLs in priority order: request option, `WARPPLUS_TEST_URL`,
/// `WARPPLUS_TEST_URLS` and config file entries, then built-in defaults.
/// Blank entries and duplicates are dropped.
pub fn candidate_test_urls(explicit: Option<&str>, settings: &Settings) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(16);
    let mut add = |url: &str| {
        let url = url.trim();
        if !url.is_empty() && !out.iter().any(|u| u == url) {
            out.push(url.to_string());
        }
    };

    if let Some(url) = explicit {
        add(url);
    }
    if let Some(url) = settings.test_url.as_deref() {
        add(url);
    }
    for url in &settings.test_urls {
        add(url.as_str());
    }
    for url in DEFAULT_TEST_URLS {
        add(*url);
    }
    out
}

/// Extra acceptance test run once a candidate's port is open
#[async_trait]
pub trait CandidateCheck: Send + Sync {
    /// `socks_addr` is the engine's listener, `probe_url` the URL the engine was started with
    async fn verify(&self, socks_addr: &str, probe_url: &str) -> Result<()>;
}

/// Winning run
pub struct SearchOutcome {
    pub url: String,
    /// Set when the winner came from the endpoint scan
    pub endpoint: Option<String>,
    /// Still running
    pub engine: TunnelEngine,
    /// Engine starts attempted, including the winner
    pub starts: usize,
}

impl SearchOutcome {
    pub fn describe(&self) -> String {
        match &self.endpoint {
            Some(ep) => format!("probe={}, ep={}", self.url, ep),
            None => format!("probe={}", self.url),
        }
    }
}

pub struct CandidateSearch {
    runner: Arc<dyn ProcessRunner>,
    scanner: Arc<dyn EndpointScan>,
    limits: SearchLimits,
    check: Option<Arc<dyn CandidateCheck>>,
}

impl CandidateSearch {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        scanner: Arc<dyn EndpointScan>,
        limits: SearchLimits,
    ) -> Self {
        CandidateSearch {
            runner,
            scanner,
            limits,
            check: None,
        }
    }

    pub fn with_check(mut self, check: Arc<dyn CandidateCheck>) -> Self {
        self.check = Some(check);
        self
    }

    /// Run both phases until one candidate wins.
    ///
    /// Errors with [`Error::Cancelled`] when `cancel` fires (the engine under
    /// test is stopped first) and [`Error::SearchExhausted`] carrying the last
    /// failure when nothing worked.
    pub async fn run(
        &self,
        base: &TunnelConfig,
        urls: &[String],
        cancel: &CancellationToken,
    ) -> Result<SearchOutcome> {
        let mut starts = 0usize;
        let mut last_error: Option<Error> = None;

        for url in urls {
            let config = base.with_test_url(url);
            match self
                .attempt(config, url, self.limits.probe_timeout(), cancel, &mut starts)
                .await
            {
                Ok(engine) => {
                    info!("Tunnel engine ready with probe {}", url);
                    return Ok(SearchOutcome {
                        url: url.clone(),
                        endpoint: None,
                        engine,
                        starts,
                    });
                }
                Err(e) if e.is_retryable() => {
                    debug!("Probe {} failed: {}", url, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        info!("All {} probe URLs failed, scanning endpoints", urls.len());
        let endpoints = tokio::select! {
            scanned = self.scanner.scan() => match scanned {
                Ok(endpoints) => endpoints,
                Err(e) => {
                    warn!("Endpoint scan failed: {}", e);
                    last_error = Some(e);
                    Vec::new()
                }
            },
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        let scan_urls = &urls[..urls.len().min(self.limits.max_scan_urls)];
        for endpoint in endpoints.iter().take(self.limits.max_endpoints) {
            for url in scan_urls {
                let config = base.with_endpoint(&endpoint.address).with_test_url(url);
                match self
                    .attempt(config, url, self.limits.scan_timeout(), cancel, &mut starts)
                    .await
                {
                    Ok(engine) => {
                        info!(
                            "Tunnel engine ready with endpoint {} and probe {}",
                            endpoint.address, url
                        );
                        return Ok(SearchOutcome {
                            url: url.clone(),
                            endpoint: Some(endpoint.address.clone()),
                            engine,
                            starts,
                        });
                    }
                    Err(e) if e.is_retryable() => {
                        debug!("Endpoint {} with probe {} failed: {}", endpoint.address, url, e);
                        last_error = Some(e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Err(Error::SearchExhausted(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no candidates".to_string()),
        ))
    }

    /// Start one engine and wait for it; the engine is stopped on any failure
    async fn attempt(
        &self,
        config: TunnelConfig,
        url: &str,
        limit: Duration,
        cancel: &CancellationToken,
        starts: &mut usize,
    ) -> Result<TunnelEngine> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let engine = TunnelEngine::new(config, self.runner.clone());
        *starts += 1;
        engine.start().await?;

        let ready = tokio::select! {
            res = self.ready(&engine, url, limit) => res,
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };

        if let Err(e) = ready {
            if let Err(stop_err) = engine.stop().await {
                warn!("Failed to stop losing engine: {}", stop_err);
            }
            return Err(e);
        }
        Ok(engine)
    }

    async fn ready(&self, engine: &TunnelEngine, url: &str, limit: Duration) -> Result<()> {
        let bind = engine.bind();
        tokio::select! {
            res = wait_port(bind, limit) => res?,
            err = exited(engine) => return Err(err),
        }
        if let Some(check) = &self.check {
            check.verify(bind, url).await?;
        }
        Ok(())
    }
}

/// Resolves once the engine's monitor has recorded an exit
async fn exited(engine: &TunnelEngine) -> Error {
    while engine.is_active() {
        sleep(ENGINE_EXIT_POLL).await;
    }
    let recorded = engine.last_error().unwrap_or_default();
    let reason = recorded
        .strip_prefix("process exited: ")
        .unwrap_or(recorded.as_str())
        .to_string();
    Error::ProcessExit(if reason.is_empty() {
        format!("engine on {} exited", engine.bind())
    } else {
        reason
    })
}
