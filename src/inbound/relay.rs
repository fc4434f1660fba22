//! Always-on local SOCKS5 relay
//!
//! Accepts clients as soon as it is bound, before the tunnel engine is up.
//! Each CONNECT is chained through the upstream SOCKS5 port when that port
//! answers a quick probe, dialed directly when direct fallback is allowed,
//! and refused with a general failure otherwise.

use super::InboundListener;
use crate::common::net::{configure_tcp_stream, join_host_port, probe_tcp, Address};
use crate::common::socks::{
    read_address_and_port, AuthResponse, Greeting, RequestHeader, Response, AUTH_NO_AUTH,
    REP_ADDRESS_TYPE_NOT_SUPPORTED, REP_COMMAND_NOT_SUPPORTED, REP_GENERAL_FAILURE,
};
use crate::outbound::socks5;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

/// TCP probe of the upstream port before chaining
pub const UPSTREAM_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Direct dial bound when falling back
pub const DIRECT_DIAL_TIMEOUT: Duration = Duration::from_secs(4);

/// How long `stop` lets in-flight connections drain
pub const STOP_GRACE: Duration = Duration::from_secs(2);

/// Client greeting and request must arrive within this bound
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Public listen address
    pub listen: String,
    /// Tunnel engine SOCKS5 address
    pub upstream: Option<String>,
    /// Dial targets directly while the upstream is not usable
    pub allow_direct_fallback: bool,
}

struct Running {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    force_close: CancellationToken,
    tracker: TaskTracker,
}

/// Local SOCKS5 server with optional upstream chaining
pub struct Relay {
    config: Arc<RelayConfig>,
    running: Mutex<Option<Running>>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Relay {
            config: Arc::new(config),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Bound address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    async fn accept_loop(
        listener: TcpListener,
        config: Arc<RelayConfig>,
        shutdown: CancellationToken,
        force_close: CancellationToken,
        tracker: TaskTracker,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            configure_tcp_stream(&stream);
                            let config = config.clone();
                            let force_close = force_close.clone();
                            tracker.spawn(async move {
                                if let Err(e) =
                                    serve_connection(&config, stream, peer, force_close).await
                                {
                                    debug!("Relay connection from {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Relay accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
            }
        }
        debug!("Relay accept loop on {:?} stopped", listener.local_addr().ok());
    }
}

#[async_trait]
impl InboundListener for Relay {
    fn name(&self) -> &str {
        "relay"
    }

    async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let listener = TcpListener::bind(&self.config.listen)
            .await
            .map_err(|e| Error::BindUnavailable(format!("{}: {}", self.config.listen, e)))?;
        let local_addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let force_close = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(Self::accept_loop(
            listener,
            self.config.clone(),
            shutdown.clone(),
            force_close.clone(),
            tracker.clone(),
        ));

        info!(
            "Relay listening on {} (upstream: {}, direct fallback: {})",
            local_addr,
            self.config.upstream.as_deref().unwrap_or("none"),
            self.config.allow_direct_fallback
        );
        *self.running.lock() = Some(Running {
            local_addr,
            shutdown,
            force_close,
            tracker,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return Ok(());
        };

        running.shutdown.cancel();
        running.tracker.close();
        if timeout(STOP_GRACE, running.tracker.wait()).await.is_err() {
            debug!(
                "Relay on {} closing {} connections after grace period",
                running.local_addr,
                running.tracker.len()
            );
            running.force_close.cancel();
        }
        info!("Relay on {} stopped", running.local_addr);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

async fn serve_connection(
    config: &RelayConfig,
    mut client: TcpStream,
    peer: SocketAddr,
    force_close: CancellationToken,
) -> Result<()> {
    let upstream = tokio::select! {
        res = establish(config, &mut client, peer) => res?,
        _ = force_close.cancelled() => return Err(Error::Cancelled),
    };

    pipe(client, upstream, force_close).await;
    trace!("Relay session from {} closed", peer);
    Ok(())
}

/// Negotiate with the client and open the outgoing leg
async fn establish(config: &RelayConfig, client: &mut TcpStream, peer: SocketAddr) -> Result<TcpStream> {
    let (address, port) = timeout(HANDSHAKE_TIMEOUT, read_connect(client, peer))
        .await
        .map_err(|_| Error::timeout(format!("relay handshake from {}", peer)))??;
    let host = address.to_host();
    debug!("Relay CONNECT {} -> {}", peer, address.to_string_with_port(port));

    let upstream = match open_upstream(config, &host, port).await {
        Ok(stream) => stream,
        Err(e) => {
            Response::failure(REP_GENERAL_FAILURE).write_to(client).await?;
            return Err(e);
        }
    };
    Response::success().write_to(client).await?;
    Ok(upstream)
}

/// Greeting, method choice and CONNECT request
async fn read_connect(client: &mut TcpStream, peer: SocketAddr) -> Result<(Address, u16)> {
    // anything but SOCKS5 is dropped without a reply
    let greeting = Greeting::read_from(client).await?;
    trace!("Relay greeting from {} offers {:?}", peer, greeting.methods);
    AuthResponse::new(AUTH_NO_AUTH).write_to(client).await?;

    let header = RequestHeader::read_from(client).await?;
    if !header.is_connect() {
        Response::failure(REP_COMMAND_NOT_SUPPORTED).write_to(client).await?;
        return Err(Error::unsupported(format!("command {:#04x}", header.command)));
    }
    if !header.has_supported_address() {
        Response::failure(REP_ADDRESS_TYPE_NOT_SUPPORTED)
            .write_to(client)
            .await?;
        return Err(Error::unsupported(format!("address type {:#04x}", header.atyp)));
    }
    read_address_and_port(client, header.atyp).await
}

/// Chain through the upstream if it answers, else dial directly when allowed
async fn open_upstream(config: &RelayConfig, host: &str, port: u16) -> Result<TcpStream> {
    if let Some(upstream) = config.upstream.as_deref() {
        if probe_tcp(upstream, UPSTREAM_PROBE_TIMEOUT).await {
            match socks5::dial_via(upstream, host, port).await {
                Ok(stream) => return Ok(stream),
                Err(e) if config.allow_direct_fallback => {
                    debug!("Chaining {}:{} via {} failed ({}), dialing direct", host, port, upstream, e);
                }
                Err(e) => return Err(e),
            }
        } else {
            trace!("Upstream {} not answering", upstream);
        }
    }

    if !config.allow_direct_fallback {
        return Err(Error::UpstreamConnectFailed {
            code: REP_GENERAL_FAILURE,
        });
    }

    let target = join_host_port(host, port);
    let stream = timeout(DIRECT_DIAL_TIMEOUT, TcpStream::connect(&target))
        .await
        .map_err(|_| Error::timeout(format!("direct dial {}", target)))??;
    configure_tcp_stream(&stream);
    Ok(stream)
}

/// One copy task per direction. A clean EOF is forwarded as a half-close and
/// the other direction keeps flowing; an error or `force_close` ends both.
async fn pipe(client: TcpStream, upstream: TcpStream, force_close: CancellationToken) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let mut outbound = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        copied
    });
    let mut inbound = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        copied
    });

    // Some(true) when the client -> upstream direction finished cleanly
    let first = tokio::select! {
        res = &mut outbound => copy_finished("client -> upstream", res).then_some(true),
        res = &mut inbound => copy_finished("upstream -> client", res).then_some(false),
        _ = force_close.cancelled() => None,
    };
    if let Some(outbound_done) = first {
        let rest = if outbound_done { &mut inbound } else { &mut outbound };
        tokio::select! {
            res = rest => {
                copy_finished("remaining direction", res);
            }
            _ = force_close.cancelled() => {}
        }
    }
    outbound.abort();
    inbound.abort();
}

fn copy_finished(
    direction: &str,
    res: std::result::Result<std::io::Result<u64>, tokio::task::JoinError>,
) -> bool {
    trace!("{} done: {:?}", direction, res);
    matches!(res, Ok(Ok(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::socks::encode_connect_domain;
    use tokio::io::AsyncReadExt;

    async fn start_relay(upstream: Option<String>, direct: bool) -> (Relay, String) {
        let relay = Relay::new(RelayConfig {
            listen: "127.0.0.1:0".into(),
            upstream,
            allow_direct_fallback: direct,
        });
        relay.start().await.unwrap();
        let addr = relay.local_addr().unwrap().to_string();
        (relay, addr)
    }

    async fn greet(addr: &str) -> TcpStream {
        let mut s = TcpStream::connect(addr).await.unwrap();
        s.write_all(&[5, 1, 0]).await.unwrap();
        let mut choice = [0u8; 2];
        s.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [5, 0]);
        s
    }

    async fn closed_port() -> u16 {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_bind_command_rejected() {
        let (relay, addr) = start_relay(None, false).await;
        let mut s = greet(&addr).await;
        s.write_all(&[5, 2, 0, 1]).await.unwrap();
        let mut reply = [0u8; 10];
        s.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_COMMAND_NOT_SUPPORTED);
        relay.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_address_type_rejected() {
        let (relay, addr) = start_relay(None, true).await;
        let mut s = greet(&addr).await;
        s.write_all(&[5, 1, 0, 9]).await.unwrap();
        let mut reply = [0u8; 10];
        s.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_ADDRESS_TYPE_NOT_SUPPORTED);
        relay.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_version_closed_silently() {
        let (relay, addr) = start_relay(None, true).await;
        let mut s = TcpStream::connect(&addr).await.unwrap();
        s.write_all(&[4, 1]).await.unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(s.read(&mut buf).await.unwrap(), 0);
        relay.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_upstream_no_fallback_is_general_failure() {
        let upstream = format!("127.0.0.1:{}", closed_port().await);
        let (relay, addr) = start_relay(Some(upstream), false).await;
        let mut s = greet(&addr).await;
        s.write_all(&encode_connect_domain("example.com", 80)).await.unwrap();
        let mut reply = [0u8; 10];
        s.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_GENERAL_FAILURE);
        relay.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_direct_fallback_pipes_data() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut s, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
        });

        let (relay, addr) = start_relay(None, true).await;
        let mut s = greet(&addr).await;
        s.write_all(&encode_connect_domain("127.0.0.1", echo_port))
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        s.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);

        s.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        s.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
        relay.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_half_close_still_delivers_response() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut s, _) = target.accept().await.unwrap();
            let mut request = Vec::new();
            s.read_to_end(&mut request).await.unwrap();
            assert_eq!(request, b"REQUEST");
            s.write_all(b"RESPONSE").await.unwrap();
        });

        let (relay, addr) = start_relay(None, true).await;
        let mut s = greet(&addr).await;
        s.write_all(&encode_connect_domain("127.0.0.1", target_port))
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        s.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0);

        s.write_all(b"REQUEST").await.unwrap();
        s.shutdown().await.unwrap();
        let mut response = Vec::new();
        timeout(Duration::from_secs(5), s.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response, b"RESPONSE");
        relay.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_closes_idle_handshake() {
        let (relay, addr) = start_relay(None, true).await;
        let mut s = TcpStream::connect(&addr).await.unwrap();
        // let the accept loop pick the connection up
        tokio::time::sleep(Duration::from_millis(100)).await;

        relay.stop().await.unwrap();
        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(3), s.read(&mut buf)).await;
        assert!(read.is_ok(), "connection still open after stop");
        assert!(matches!(read.unwrap(), Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_stop_closes_listener() {
        let (relay, addr) = start_relay(None, false).await;
        assert!(relay.is_running());
        relay.stop().await.unwrap();
        assert!(!relay.is_running());
        assert!(!probe_tcp(&addr, Duration::from_millis(200)).await);
        // second stop is a no-op
        relay.stop().await.unwrap();
    }
}
