//! Network utilities

use crate::{Error, Result};
use socket2::SockRef;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};
use tracing::trace;

/// Dial timeout used by each readiness poll
pub const READINESS_DIAL_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause between readiness polls
pub const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// SOCKS5 address type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address
    Ipv4(Ipv4Addr),
    /// IPv6 address
    Ipv6(Ipv6Addr),
    /// Domain name
    Domain(String),
}

impl Address {
    /// Convert to `host:port`, bracketing IPv6
    pub fn to_string_with_port(&self, port: u16) -> String {
        match self {
            Address::Ipv4(ip) => format!("{}:{}", ip, port),
            Address::Ipv6(ip) => format!("[{}]:{}", ip, port),
            Address::Domain(d) => format!("{}:{}", d, port),
        }
    }

    /// Get as host string
    pub fn to_host(&self) -> String {
        match self {
            Address::Ipv4(ip) => ip.to_string(),
            Address::Ipv6(ip) => ip.to_string(),
            Address::Domain(d) => d.clone(),
        }
    }
}

/// Split `host:port` (IPv6 hosts may be bracketed)
pub fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse::<u16>().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// Join host and port, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Resolve an address string to the first socket address
pub fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(|e| Error::config(format!("invalid address {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| Error::config(format!("address {} did not resolve", addr)))
}

/// Single bounded TCP connect attempt
pub async fn probe_tcp(addr: &str, limit: Duration) -> bool {
    matches!(timeout(limit, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

/// Poll `addr` until it accepts a TCP connection or `limit` elapses
pub async fn wait_port(addr: &str, limit: Duration) -> Result<()> {
    let deadline = Instant::now() + limit;
    loop {
        if probe_tcp(addr, READINESS_DIAL_TIMEOUT).await {
            return Ok(());
        }
        if Instant::now() + READINESS_POLL_INTERVAL >= deadline {
            break;
        }
        trace!("{} not ready yet", addr);
        sleep(READINESS_POLL_INTERVAL).await;
    }
    Err(Error::ReadinessTimeout(addr.to_string()))
}

/// Whether a listener could be bound at `addr` right now
pub async fn is_bindable(addr: &str) -> bool {
    match TcpListener::bind(addr).await {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(_) => false,
    }
}
