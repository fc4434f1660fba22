//! SOCKS5 client dialer
//!
//! Minimal RFC 1928 client used to chain relay connections into the tunnel
//! engine: no-auth only, CONNECT only, always domain addressing.

use crate::common::net::configure_tcp_stream;
use crate::common::socks::{
    encode_connect_domain, reply_message, skip_bound_address, AUTH_NO_AUTH, REP_SUCCEEDED,
    SOCKS5_VERSION,
};
use crate::{Error, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Bound for TCP connect plus handshake
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(4);

/// Body size returned by [`http_get_via`] when the caller passes 0
pub const DEFAULT_MAX_BODY: usize = 4096;

/// Run the client side of the handshake on an established stream
pub async fn handshake<S>(stream: &mut S, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[SOCKS5_VERSION, 0x01, AUTH_NO_AUTH]).await?;
    stream.flush().await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [SOCKS5_VERSION, AUTH_NO_AUTH] {
        return Err(Error::AuthNotAccepted);
    }

    stream.write_all(&encode_connect_domain(host, port)).await?;
    stream.flush().await?;

    // VER REP RSV ATYP
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[1] != REP_SUCCEEDED {
        debug!(
            "SOCKS5 upstream refused {}:{}: {}",
            host,
            port,
            reply_message(reply[1])
        );
        return Err(Error::UpstreamConnectFailed { code: reply[1] });
    }
    skip_bound_address(stream, reply[3]).await?;

    trace!("SOCKS5 handshake to {}:{} complete", host, port);
    Ok(())
}

/// Open a tunnelled connection to `host:port` through the SOCKS5 server at `socks_addr`
pub async fn dial_via(socks_addr: &str, host: &str, port: u16) -> Result<TcpStream> {
    dial_via_timeout(socks_addr, host, port, DIAL_TIMEOUT).await
}

pub async fn dial_via_timeout(
    socks_addr: &str,
    host: &str,
    port: u16,
    limit: Duration,
) -> Result<TcpStream> {
    let dial = async {
        let mut stream = TcpStream::connect(socks_addr).await?;
        configure_tcp_stream(&stream);
        handshake(&mut stream, host, port).await?;
        Ok::<_, Error>(stream)
    };
    timeout(limit, dial)
        .await
        .map_err(|_| Error::timeout(format!("socks5 dial via {}", socks_addr)))?
}

/// One plain `GET http://host/path` through the SOCKS5 server.
///
/// Returns the trimmed status line and at most `max_bytes` of body
/// ([`DEFAULT_MAX_BODY`] when 0). Headers are skipped.
pub async fn http_get_via(
    socks_addr: &str,
    host: &str,
    path: &str,
    max_bytes: usize,
) -> Result<(String, String)> {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    let max_bytes = if max_bytes == 0 {
        DEFAULT_MAX_BODY
    } else {
        max_bytes
    };

    let mut stream = dial_via(socks_addr, host, 80).await?;
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: tunnelkeeper/{}\r\nConnection: close\r\n\r\n",
        path,
        host,
        env!("CARGO_PKG_VERSION")
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let mut status = String::new();
    if reader.read_line(&mut status).await? == 0 {
        return Err(Error::protocol("empty HTTP response"));
    }

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            // headers ran into EOF, no body
            return Ok((status.trim().to_string(), String::new()));
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    let mut body = Vec::with_capacity(max_bytes.min(DEFAULT_MAX_BODY));
    reader.take(max_bytes as u64).read_to_end(&mut body).await?;
    Ok((
        status.trim().to_string(),
        String::from_utf8_lossy(&body).into_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_test::io::Builder;

    const OK_REPLY: [u8; 10] = [5, 0, 0, 1, 0, 0, 0, 0, 0, 0];

    #[tokio::test]
    async fn test_handshake_success() {
        let mut mock = Builder::new()
            .write(&[5, 1, 0])
            .read(&[5, 0])
            .write(&encode_connect_domain("example.com", 443))
            .read(&OK_REPLY)
            .build();
        handshake(&mut mock, "example.com", 443).await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_skips_ipv6_bound_address() {
        let mut reply = vec![5, 0, 0, 4];
        reply.extend_from_slice(&[0u8; 18]);
        let mut mock = Builder::new()
            .write(&[5, 1, 0])
            .read(&[5, 0])
            .write(&encode_connect_domain("example.com", 80))
            .read(&reply)
            .build();
        handshake(&mut mock, "example.com", 80).await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_not_accepted() {
        let mut mock = Builder::new().write(&[5, 1, 0]).read(&[5, 0xff]).build();
        let err = handshake(&mut mock, "example.com", 443).await.unwrap_err();
        assert!(matches!(err, Error::AuthNotAccepted));
    }

    #[tokio::test]
    async fn test_connect_refused_code() {
        let mut mock = Builder::new()
            .write(&[5, 1, 0])
            .read(&[5, 0])
            .write(&encode_connect_domain("example.com", 443))
            .read(&[5, 5, 0, 1])
            .build();
        let err = handshake(&mut mock, "example.com", 443).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamConnectFailed { code: 5 }));
    }

    #[tokio::test]
    async fn test_unknown_bound_atyp() {
        let mut mock = Builder::new()
            .write(&[5, 1, 0])
            .read(&[5, 0])
            .write(&encode_connect_domain("example.com", 443))
            .read(&[5, 0, 0, 9])
            .build();
        let err = handshake(&mut mock, "example.com", 443).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_dial_refused_socks_server() {
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().to_string()
        };
        assert!(dial_via(&addr, "example.com", 80).await.is_err());
    }

    /// Tiny SOCKS5 + HTTP responder for a single connection
    async fn serve_once(listener: TcpListener, response: &'static [u8]) {
        let (mut s, _) = listener.accept().await.unwrap();
        let mut greeting = [0u8; 3];
        s.read_exact(&mut greeting).await.unwrap();
        s.write_all(&[5, 0]).await.unwrap();
        let mut head = [0u8; 5];
        s.read_exact(&mut head).await.unwrap();
        let mut rest = vec![0u8; head[4] as usize + 2];
        s.read_exact(&mut rest).await.unwrap();
        s.write_all(&OK_REPLY).await.unwrap();

        let mut req = Vec::new();
        let mut byte = [0u8; 1];
        while !req.ends_with(b"\r\n\r\n") {
            s.read_exact(&mut byte).await.unwrap();
            req.push(byte[0]);
        }
        assert!(req.starts_with(b"GET /cdn-cgi/trace HTTP/1.1\r\n"));
        s.write_all(response).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_get_via() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(serve_once(
            listener,
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nwarp=on\nip=1.2.3.4\n",
        ));

        let (status, body) = http_get_via(&addr, "1.1.1.1", "cdn-cgi/trace", 7)
            .await
            .unwrap();
        assert_eq!(status, "HTTP/1.1 200 OK");
        assert_eq!(body, "warp=on");
        server.await.unwrap();
    }
}
