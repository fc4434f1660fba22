//! Configuration module
//!
//! Settings come from three layers, later layers winning:
//! an optional YAML file, `WARPPLUS_*` / `SINGBOX_BIN` / `BP_*` environment
//! variables, and command line flags applied by the binary.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Default control API address
pub const DEFAULT_LISTEN: &str = "127.0.0.1:4765";

/// Default state directory
pub const DEFAULT_STATE_DIR: &str = "./state";

/// Port the tunnel engine always binds its SOCKS listener to
pub const RESERVED_ENGINE_PORT: u16 = 8086;

/// Public relay port range scanned when nothing else is usable
pub const PUBLIC_PORT_RANGE: std::ops::RangeInclusive<u16> = 8087..=8090;

/// Default tunnel engine executable name
#[cfg(windows)]
pub const DEFAULT_WARP_PLUS_BIN: &str = "warp-plus.exe";

#[cfg(not(windows))]
pub const DEFAULT_WARP_PLUS_BIN: &str = "warp-plus";

/// Default virtualization engine executable name
#[cfg(windows)]
pub const DEFAULT_SING_BOX_BIN: &str = "sb-helper.exe";

#[cfg(not(windows))]
pub const DEFAULT_SING_BOX_BIN: &str = "sb-helper";

/// Built-in connectivity probe URLs, tried after every override
pub const DEFAULT_TEST_URLS: &[&str] = &[
    "http://connectivity.cloudflareclient.com/cdn-cgi/trace",
    "http://connectivitycheck.gstatic.com/generate_204",
    "http://1.1.1.1/cdn-cgi/trace",
    "https://1.1.1.1/cdn-cgi/trace",
    "http://detectportal.firefox.com/success.txt",
    "http://neverssl.com/",
    "http://cp.cloudflare.com/",
    "http://example.com/",
];

/// Daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    /// Control API listen address
    pub listen: String,

    /// Directory holding identity, bind record, engine cache and logs
    pub state_dir: PathBuf,

    /// Loopback port the tunnel engine binds its SOCKS listener to
    pub engine_port: u16,

    /// Tunnel engine executable
    pub warp_plus_bin: Option<String>,

    /// Virtualization engine executable
    pub sing_box_bin: Option<String>,

    /// DNS server handed to the virtualization config
    pub dns: Option<String>,

    /// Force IPv4 endpoints
    pub ipv4_only: bool,

    /// Force IPv6 endpoints
    pub ipv6_only: bool,

    /// Pass --verbose to the tunnel engine
    pub verbose: bool,

    /// Let the relay dial targets directly while the tunnel is not ready
    pub direct_fallback: bool,

    /// Single probe URL override
    pub test_url: Option<String>,

    /// Probe URL overrides, tried after `test_url`
    pub test_urls: Vec<String>,

    /// Candidate search bounds
    pub search: SearchLimits,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            listen: DEFAULT_LISTEN.to_string(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            engine_port: RESERVED_ENGINE_PORT,
            warp_plus_bin: None,
            sing_box_bin: None,
            dns: None,
            ipv4_only: false,
            ipv6_only: false,
            verbose: false,
            direct_fallback: false,
            test_url: None,
            test_urls: Vec::new(),
            search: SearchLimits::default(),
        }
    }
}

/// Bounds applied by the candidate search
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SearchLimits {
    /// Readiness wait per probe URL in the first phase
    pub probe_timeout_ms: u64,
    /// Readiness wait per (endpoint, URL) pair in the second phase
    pub scan_timeout_ms: u64,
    /// Scanned endpoints tried at most
    pub max_endpoints: usize,
    /// Probe URLs reused per scanned endpoint
    pub max_scan_urls: usize,
}

impl Default for SearchLimits {
    fn default() -> Self {
        SearchLimits {
            probe_timeout_ms: 45_000,
            scan_timeout_ms: 35_000,
            max_endpoints: 15,
            max_scan_urls: 3,
        }
    }
}

impl SearchLimits {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
}

impl Settings {
    /// Load settings from a YAML file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    /// Load from string
    pub fn from_str(content: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<()> {
        if self.listen.trim().is_empty() {
            return Err(Error::config("listen address must not be empty"));
        }
        if self.ipv4_only && self.ipv6_only {
            return Err(Error::config("ipv4-only and ipv6-only are mutually exclusive"));
        }
        if self.engine_port == 0 {
            return Err(Error::config("engine-port must not be 0"));
        }
        if PUBLIC_PORT_RANGE.contains(&self.engine_port) {
            return Err(Error::config(format!(
                "engine-port {} collides with the relay port range",
                self.engine_port
            )));
        }
        if self.search.max_scan_urls == 0 {
            return Err(Error::config("search.max-scan-urls must be at least 1"));
        }
        Ok(())
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides using a custom variable lookup
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(bin) = non_empty("WARPPLUS_BIN") {
            self.warp_plus_bin = Some(bin);
        }
        if let Some(bin) = non_empty("SINGBOX_BIN") {
            self.sing_box_bin = Some(bin);
        }
        if let Some(dns) = non_empty("WARPPLUS_DNS") {
            self.dns = Some(dns);
        }
        if let Some(v) = non_empty("WARPPLUS_IPV4") {
            self.ipv4_only = env_flag(&v);
        }
        if let Some(v) = non_empty("WARPPLUS_IPV6") {
            self.ipv6_only = env_flag(&v);
        }
        if let Some(v) = non_empty("WARPPLUS_VERBOSE") {
            self.verbose = env_flag(&v);
        }
        if let Some(v) = non_empty("BP_SOCKS_DIRECT_FALLBACK") {
            self.direct_fallback = env_flag(&v);
        }
        if let Some(url) = non_empty("WARPPLUS_TEST_URL") {
            self.test_url = Some(url.trim().to_string());
        }
        if let Some(list) = non_empty("WARPPLUS_TEST_URLS") {
            let mut urls = split_and_trim(&list, ',');
            urls.extend(std::mem::take(&mut self.test_urls));
            self.test_urls = urls;
        }
    }

    /// Tunnel engine executable: explicit path, then configured/env value, then platform default
    pub fn warp_plus_bin(&self, explicit: Option<&str>) -> String {
        resolve_binary(explicit, self.warp_plus_bin.as_deref(), DEFAULT_WARP_PLUS_BIN)
    }

    /// Virtualization engine executable, same precedence as [`Settings::warp_plus_bin`]
    pub fn sing_box_bin(&self, explicit: Option<&str>) -> String {
        resolve_binary(explicit, self.sing_box_bin.as_deref(), DEFAULT_SING_BOX_BIN)
    }

    /// URL the system proxy should load the PAC file from
    pub fn pac_url(&self) -> String {
        format!("http://{}/proxy.pac", self.listen)
    }

    /// Address the tunnel engine binds its SOCKS listener to
    pub fn engine_bind(&self) -> String {
        format!("127.0.0.1:{}", self.engine_port)
    }
}

fn resolve_binary(explicit: Option<&str>, configured: Option<&str>, default: &str) -> String {
    explicit
        .filter(|s| !s.is_empty())
        .or(configured.filter(|s| !s.is_empty()))
        .unwrap_or(default)
        .to_string()
}

/// `"1"` and `"true"` (any case) enable a flag
pub fn env_flag(value: &str) -> bool {
    let v = value.trim();
    v == "1" || v.eq_ignore_ascii_case("true")
}

/// Split on `sep`, trim each part and drop empties
pub fn split_and_trim(s: &str, sep: char) -> Vec<String> {
    s.split(sep)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.listen, DEFAULT_LISTEN);
        assert_eq!(settings.search.max_endpoints, 15);
        assert_eq!(settings.search.max_scan_urls, 3);
        assert_eq!(settings.search.probe_timeout(), Duration::from_secs(45));
        assert_eq!(settings.engine_bind(), "127.0.0.1:8086");
        assert!(!settings.direct_fallback);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
listen: 127.0.0.1:9000
state-dir: /var/lib/tk
direct-fallback: true
test-urls:
  - http://a/
search:
  probe-timeout-ms: 1000
"#;
        let settings = Settings::from_str(yaml).unwrap();
        assert_eq!(settings.listen, "127.0.0.1:9000");
        assert_eq!(settings.state_dir, PathBuf::from("/var/lib/tk"));
        assert!(settings.direct_fallback);
        assert_eq!(settings.test_urls, vec!["http://a/".to_string()]);
        assert_eq!(settings.search.probe_timeout_ms, 1000);
        assert_eq!(settings.search.scan_timeout_ms, 35_000);
        assert_eq!(settings.pac_url(), "http://127.0.0.1:9000/proxy.pac");
    }

    #[test]
    fn test_conflicting_ip_families_rejected() {
        let yaml = "ipv4-only: true\nipv6-only: true\n";
        assert!(Settings::from_str(yaml).is_err());
    }

    #[test]
    fn test_engine_port_outside_relay_range() {
        assert!(Settings::from_str("engine-port: 8088\n").is_err());
        let settings = Settings::from_str("engine-port: 18086\n").unwrap();
        assert_eq!(settings.engine_bind(), "127.0.0.1:18086");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("WARPPLUS_BIN", "/opt/warp-plus"),
            ("WARPPLUS_IPV4", "TRUE"),
            ("BP_SOCKS_DIRECT_FALLBACK", "1"),
            ("WARPPLUS_TEST_URL", " http://env/ "),
            ("WARPPLUS_TEST_URLS", "http://l1/, ,http://l2/"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings {
            test_urls: vec!["http://file/".to_string()],
            ..Default::default()
        };
        settings.apply_env_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(settings.warp_plus_bin(None), "/opt/warp-plus");
        assert_eq!(settings.warp_plus_bin(Some("/explicit")), "/explicit");
        assert!(settings.ipv4_only);
        assert!(settings.direct_fallback);
        assert_eq!(settings.test_url.as_deref(), Some("http://env/"));
        assert_eq!(
            settings.test_urls,
            vec!["http://l1/", "http://l2/", "http://file/"]
        );
    }

    #[test]
    fn test_binary_platform_default() {
        let settings = Settings::default();
        assert_eq!(settings.sing_box_bin(Some("")), DEFAULT_SING_BOX_BIN);
        assert_eq!(settings.warp_plus_bin(None), DEFAULT_WARP_PLUS_BIN);
    }

    #[test]
    fn test_env_flag() {
        assert!(env_flag("1"));
        assert!(env_flag("true"));
        assert!(!env_flag("yes"));
        assert!(!env_flag("0"));
    }
}
