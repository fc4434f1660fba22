//! SOCKS5 protocol subset (RFC 1928): no-auth negotiation and CONNECT

use super::net::Address;
use crate::{Error, Result};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// SOCKS5 version
pub const SOCKS5_VERSION: u8 = 0x05;

// SOCKS5 authentication methods
pub const AUTH_NO_AUTH: u8 = 0x00;

// SOCKS5 commands
pub const CMD_CONNECT: u8 = 0x01;

// SOCKS5 address types
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

// SOCKS5 reply codes
pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_CONNECTION_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Longest domain a SOCKS5 address can carry
pub const MAX_DOMAIN_LEN: usize = 255;

/// Client greeting: version + offered methods
#[derive(Debug)]
pub struct Greeting {
    pub methods: Vec<u8>,
}

impl Greeting {
    /// Read a greeting. A wrong version byte is a protocol error and nothing is replied.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut head = [0u8; 2];
        reader.read_exact(&mut head).await?;

        if head[0] != SOCKS5_VERSION {
            return Err(Error::protocol(format!(
                "Unsupported SOCKS version: {}",
                head[0]
            )));
        }

        let mut methods = vec![0u8; head[1] as usize];
        reader.read_exact(&mut methods).await?;

        Ok(Greeting { methods })
    }
}

/// Method selection reply
pub struct AuthResponse {
    pub method: u8,
}

impl AuthResponse {
    pub fn new(method: u8) -> Self {
        AuthResponse { method }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[SOCKS5_VERSION, self.method]).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Fixed four-byte request header: VER CMD RSV ATYP
#[derive(Debug, Clone, Copy)]
pub struct RequestHeader {
    pub version: u8,
    pub command: u8,
    pub atyp: u8,
}

impl RequestHeader {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header).await?;
        Ok(RequestHeader {
            version: header[0],
            command: header[1],
            atyp: header[3],
        })
    }

    pub fn is_connect(&self) -> bool {
        self.version == SOCKS5_VERSION && self.command == CMD_CONNECT
    }

    pub fn has_supported_address(&self) -> bool {
        matches!(self.atyp, ATYP_IPV4 | ATYP_DOMAIN | ATYP_IPV6)
    }
}

/// Read DST.ADDR and DST.PORT for the given address type
pub async fn read_address_and_port<R: AsyncRead + Unpin>(
    reader: &mut R,
    atyp: u8,
) -> Result<(Address, u16)> {
    match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            reader.read_exact(&mut buf).await?;
            let addr = Address::Ipv4(Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]));
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Ok((addr, port))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            reader.read_exact(&mut len).await?;
            let len = len[0] as usize;
            let mut buf = vec![0u8; len + 2];
            reader.read_exact(&mut buf).await?;
            let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
            buf.truncate(len);
            let domain = String::from_utf8(buf)
                .map_err(|e| Error::parse(format!("Invalid domain: {}", e)))?;
            Ok((Address::Domain(domain), port))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            reader.read_exact(&mut buf).await?;
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&buf[..16]);
            let addr = Address::Ipv6(Ipv6Addr::from(ip));
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Ok((addr, port))
        }
        t => Err(Error::protocol(format!("Unknown address type: {}", t))),
    }
}

/// Consume BND.ADDR and BND.PORT of a reply without interpreting them
pub async fn skip_bound_address<R: AsyncRead + Unpin>(reader: &mut R, atyp: u8) -> Result<()> {
    let len = match atyp {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            reader.read_exact(&mut len).await?;
            len[0] as usize
        }
        t => return Err(Error::protocol(format!("Unknown address type in reply: {}", t))),
    };
    let mut buf = vec![0u8; len + 2];
    reader.read_exact(&mut buf).await?;
    Ok(())
}

/// Truncate a hostname to what a domain ATYP can carry, on a char boundary
pub fn truncate_domain(host: &str) -> &str {
    if host.len() <= MAX_DOMAIN_LEN {
        return host;
    }
    let mut end = MAX_DOMAIN_LEN;
    while !host.is_char_boundary(end) {
        end -= 1;
    }
    &host[..end]
}

/// Encode a CONNECT request using domain-name addressing
pub fn encode_connect_domain(host: &str, port: u16) -> Vec<u8> {
    let host = truncate_domain(host).as_bytes();
    let mut buf = Vec::with_capacity(7 + host.len());
    buf.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
    buf.push(host.len() as u8);
    buf.extend_from_slice(host);
    buf.extend_from_slice(&port.to_be_bytes());
    buf
}

/// Reply to a CONNECT request. The bound address is always the IPv4 placeholder.
pub struct Response {
    pub reply: u8,
}

impl Response {
    pub fn success() -> Self {
        Response {
            reply: REP_SUCCEEDED,
        }
    }

    pub fn failure(reply: u8) -> Self {
        Response { reply }
    }

    pub fn to_bytes(&self) -> [u8; 10] {
        let mut buf = [0u8; 10];
        buf[0] = SOCKS5_VERSION;
        buf[1] = self.reply;
        buf[2] = 0x00;
        buf[3] = ATYP_IPV4;
        buf
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Human readable text for a reply code
pub fn reply_message(code: u8) -> String {
    match code {
        REP_SUCCEEDED => "Succeeded".to_string(),
        REP_GENERAL_FAILURE => "General SOCKS server failure".to_string(),
        REP_CONNECTION_NOT_ALLOWED => "Connection not allowed by ruleset".to_string(),
        REP_NETWORK_UNREACHABLE => "Network unreachable".to_string(),
        REP_HOST_UNREACHABLE => "Host unreachable".to_string(),
        REP_CONNECTION_REFUSED => "Connection refused".to_string(),
        REP_TTL_EXPIRED => "TTL expired".to_string(),
        REP_COMMAND_NOT_SUPPORTED => "Command not supported".to_string(),
        REP_ADDRESS_TYPE_NOT_SUPPORTED => "Address type not supported".to_string(),
        _ => format!("Unknown error: {}", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_greeting_rejects_socks4() {
        let mut input: &[u8] = &[0x04, 0x01, 0x00];
        assert!(Greeting::read_from(&mut input).await.is_err());
    }

    #[tokio::test]
    async fn test_greeting_reads_methods() {
        let mut input: &[u8] = &[0x05, 0x02, 0x00, 0x02];
        let greeting = Greeting::read_from(&mut input).await.unwrap();
        assert_eq!(greeting.methods, vec![AUTH_NO_AUTH, 0x02]);
    }

    #[tokio::test]
    async fn test_read_domain_request() {
        let mut input: &[u8] = &[
            0x05, 0x01, 0x00, 0x03, 11, b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'c',
            b'o', b'm', 0x01, 0xbb,
        ];
        let header = RequestHeader::read_from(&mut input).await.unwrap();
        assert!(header.is_connect());
        assert!(header.has_supported_address());
        let (addr, port) = read_address_and_port(&mut input, header.atyp).await.unwrap();
        assert_eq!(addr, Address::Domain("example.com".to_string()));
        assert_eq!(port, 443);
    }

    #[tokio::test]
    async fn test_bind_command_is_not_connect() {
        let mut input: &[u8] = &[0x05, 0x02, 0x00, 0x01];
        let header = RequestHeader::read_from(&mut input).await.unwrap();
        assert!(!header.is_connect());
    }

    #[test]
    fn test_encode_connect_truncates_long_host() {
        let host = "a".repeat(300);
        let req = encode_connect_domain(&host, 80);
        assert_eq!(req[4] as usize, MAX_DOMAIN_LEN);
        assert_eq!(req.len(), 5 + MAX_DOMAIN_LEN + 2);
        assert_eq!(&req[req.len() - 2..], &[0x00, 0x50]);
    }

    #[test]
    fn test_failure_reply_layout() {
        let bytes = Response::failure(REP_COMMAND_NOT_SUPPORTED).to_bytes();
        assert_eq!(bytes, [0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_skip_bound_address_ipv6() {
        let mut input = vec![0u8; 18];
        input.push(0xAA);
        let mut reader: &[u8] = &input;
        skip_bound_address(&mut reader, ATYP_IPV6).await.unwrap();
        assert_eq!(reader, &[0xAA]);
    }
}
