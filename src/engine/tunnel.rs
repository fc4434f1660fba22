//! `warp-plus` tunnel engine

use super::supervisor::{EngineState, Supervisor};
use crate::process::{CommandSpec, ProcessRunner};
use crate::{Error, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Which upstream the engine builds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Plain WARP
    Warp,
    /// WARP in WARP
    Gool,
    /// Psiphon over WARP, optionally pinned to an exit country
    Cfon,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "warp" => Ok(Mode::Warp),
            "gool" => Ok(Mode::Gool),
            "psiphon" | "cfon" => Ok(Mode::Cfon),
            other => Err(Error::UnknownMode(other.to_string())),
        }
    }
}

/// Launch parameters for one engine run
#[derive(Debug, Clone, Default)]
pub struct TunnelConfig {
    pub bin: String,
    pub bind: String,
    pub mode: String,
    pub country: Option<String>,
    pub key: Option<String>,
    pub endpoint: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub test_url: Option<String>,
    pub ipv4_only: bool,
    pub ipv6_only: bool,
    pub verbose: bool,
}

impl TunnelConfig {
    /// Copy with a different connectivity probe URL
    pub fn with_test_url(&self, url: &str) -> Self {
        TunnelConfig {
            test_url: Some(url.to_string()),
            ..self.clone()
        }
    }

    /// Copy pinned to a scanned endpoint
    pub fn with_endpoint(&self, endpoint: &str) -> Self {
        TunnelConfig {
            endpoint: Some(endpoint.to_string()),
            ..self.clone()
        }
    }

    /// Engine argument list. Fails on an unknown mode.
    pub fn args(&self) -> Result<Vec<String>> {
        let mode: Mode = self.mode.parse()?;

        let mut args = Vec::new();
        if self.verbose {
            args.push("--verbose".to_string());
        }
        args.push("--bind".to_string());
        args.push(self.bind.clone());
        if self.ipv4_only {
            args.push("-4".to_string());
        }
        if self.ipv6_only {
            args.push("-6".to_string());
        }
        push_opt(&mut args, "--key", self.key.as_deref());
        push_opt(&mut args, "--endpoint", self.endpoint.as_deref());
        if let Some(dir) = &self.cache_dir {
            args.push("--cache-dir".to_string());
            args.push(dir.display().to_string());
        }
        push_opt(&mut args, "--test-url", self.test_url.as_deref());

        match mode {
            Mode::Warp => {}
            Mode::Gool => args.push("--gool".to_string()),
            Mode::Cfon => {
                args.push("--cfon".to_string());
                push_opt(&mut args, "--country", self.country.as_deref());
            }
        }
        Ok(args)
    }

    pub fn command(&self) -> Result<CommandSpec> {
        Ok(CommandSpec::new(self.bin.clone(), self.args()?).with_log(self.log_path.clone()))
    }
}

fn push_opt(args: &mut Vec<String>, flag: &str, value: Option<&str>) {
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        args.push(flag.to_string());
        args.push(v.to_string());
    }
}

/// Supervises one `warp-plus` process
pub struct TunnelEngine {
    config: TunnelConfig,
    supervisor: Supervisor,
}

impl TunnelEngine {
    pub fn new(config: TunnelConfig, runner: Arc<dyn ProcessRunner>) -> Self {
        TunnelEngine {
            config,
            supervisor: Supervisor::new("warp-plus", runner),
        }
    }

    pub async fn start(&self) -> Result<()> {
        // argv is built first so a bad mode never reaches the runner
        let spec = self.config.command()?;
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

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn bind(&self) -> &str {
        &self.config.bind
    }
}
