//! Forward-proxy negotiation.
//!
//! Two tunnel styles are supported on stream connections:
//!
//! - SOCKS5 (RFC 1928/1929): method greeting, optional username/password
//!   subnegotiation, CONNECT request, reply with the proxy's bound
//!   address.
//! - HTTP CONNECT: a single request/response exchange, with optional
//!   Basic credentials.
//!
//! Both handshakes run inside the connect phase and share its deadline.
//! Frame building and parsing are pure functions; only the exchange
//! itself touches the connection.

use std::net::{IpAddr, SocketAddr};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::BytesMut;

use crate::base::error::SockError;
use crate::socket::binding::Direction;
use crate::socket::conn::Connection;
use crate::socket::timeout::TimeoutController;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const MAX_CONNECT_RESPONSE: usize = 16 * 1024;

/// The origin the tunnel should reach, validated for the wire formats
/// both proxy styles use.
#[derive(Debug, Clone)]
pub(crate) struct TargetAddr {
    host: String,
    port: u16,
}

impl TargetAddr {
    pub(crate) fn new(host: &str, port: u16) -> Result<Self, SockError> {
        if host.is_empty() || host.len() > 255 {
            return Err(SockError::InvalidAddress(host.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// SOCKS5 proxy endpoint, with optional username/password credentials.
#[derive(Debug, Clone)]
pub struct Socks5Config {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Socks5Config {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    fn wants_auth(&self) -> bool {
        self.username.is_some()
    }
}

/// HTTP CONNECT proxy endpoint, with optional Basic credentials.
#[derive(Debug, Clone)]
pub struct HttpProxyConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl HttpProxyConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// Which proxy a connection tunnels through. At most one is active.
#[derive(Debug, Clone)]
pub enum ProxyConfig {
    Socks5(Socks5Config),
    HttpConnect(HttpProxyConfig),
}

impl ProxyConfig {
    pub(crate) fn host(&self) -> &str {
        match self {
            ProxyConfig::Socks5(c) => &c.host,
            ProxyConfig::HttpConnect(c) => &c.host,
        }
    }

    pub(crate) fn port(&self) -> u16 {
        match self {
            ProxyConfig::Socks5(c) => c.port,
            ProxyConfig::HttpConnect(c) => c.port,
        }
    }
}

// --- SOCKS5 wire format ---------------------------------------------------

fn socks5_greeting(want_auth: bool) -> [u8; 3] {
    let method = if want_auth { METHOD_USERPASS } else { METHOD_NONE };
    [SOCKS_VERSION, 1, method]
}

fn socks5_auth_request(username: &str, password: &str) -> Result<Vec<u8>, SockError> {
    if username.len() > 255 || password.len() > 255 {
        return Err(SockError::Socks(
            "username/password exceed 255 bytes".into(),
        ));
    }
    let mut buf = Vec::with_capacity(3 + username.len() + password.len());
    buf.push(0x01);
    buf.push(username.len() as u8);
    buf.extend_from_slice(username.as_bytes());
    buf.push(password.len() as u8);
    buf.extend_from_slice(password.as_bytes());
    Ok(buf)
}

fn socks5_connect_request(target: &TargetAddr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(7 + target.host.len());
    buf.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00]);
    match target.host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            buf.push(ATYP_DOMAIN);
            buf.push(target.host.len() as u8);
            buf.extend_from_slice(target.host.as_bytes());
        }
    }
    buf.extend_from_slice(&target.port.to_be_bytes());
    buf
}

fn socks5_reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply code",
    }
}

/// Bytes of bound address remaining after the fixed 4-byte reply head,
/// given the address type and (for domains) the length octet.
fn socks5_bound_len(atyp: u8, first: u8) -> Result<usize, SockError> {
    match atyp {
        // 4 or 16 address bytes plus the 2-byte port; `first` is already
        // the first address byte.
        ATYP_IPV4 => Ok(3 + 2),
        ATYP_IPV6 => Ok(15 + 2),
        ATYP_DOMAIN => Ok(first as usize + 2),
        other => Err(SockError::Socks(format!(
            "unsupported bound address type {other:#04x}"
        ))),
    }
}

fn socks5_bound_addr(atyp: u8, first: u8, rest: &[u8], port_hint: &[u8]) -> Option<SocketAddr> {
    match atyp {
        ATYP_IPV4 => {
            let octets = [first, rest[0], rest[1], rest[2]];
            let port = u16::from_be_bytes([port_hint[0], port_hint[1]]);
            Some(SocketAddr::new(IpAddr::from(octets), port))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            octets[0] = first;
            octets[1..].copy_from_slice(&rest[..15]);
            let port = u16::from_be_bytes([port_hint[0], port_hint[1]]);
            Some(SocketAddr::new(IpAddr::from(octets), port))
        }
        _ => None,
    }
}

// --- HTTP CONNECT wire format ---------------------------------------------

fn http_connect_request(cfg: &HttpProxyConfig, host: &str, port: u16, out: &mut BytesMut) {
    out.extend_from_slice(format!("CONNECT {host}:{port} HTTP/1.1\r\n").as_bytes());
    out.extend_from_slice(format!("Host: {host}:{port}\r\n").as_bytes());
    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        let token = BASE64.encode(format!("{user}:{pass}"));
        out.extend_from_slice(format!("Proxy-Authorization: Basic {token}\r\n").as_bytes());
    }
    out.extend_from_slice(b"Proxy-Connection: Keep-Alive\r\n\r\n");
}

/// Parse the status code out of a CONNECT response head.
fn http_connect_status(head: &[u8]) -> Result<(u16, String), SockError> {
    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(head.len());
    let line = String::from_utf8_lossy(&head[..line_end]);
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/") {
        return Err(SockError::HttpConnect {
            status: 0,
            message: format!("malformed status line: {line}"),
        });
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| SockError::HttpConnect {
            status: 0,
            message: format!("malformed status line: {line}"),
        })?;
    let reason = parts.next().unwrap_or("").to_string();
    Ok((status, reason))
}

// --- handshake drivers ----------------------------------------------------

impl Connection {
    /// Run the SOCKS5 negotiation over the established raw connection.
    /// Returns the address the proxy reports as locally bound for the
    /// tunnel, when it has an IP form.
    pub(crate) async fn socks5_handshake(
        &mut self,
        cfg: &Socks5Config,
        target: &TargetAddr,
        ctl: &TimeoutController,
    ) -> Result<Option<SocketAddr>, SockError> {
        self.send_exact(&socks5_greeting(cfg.wants_auth())).await?;
        if ctl.has_timedout() {
            return Err(SockError::Timeout(Direction::Read));
        }
        let mut method = [0u8; 2];
        self.recv_exact(&mut method).await?;
        if method[0] != SOCKS_VERSION {
            return Err(SockError::Socks(format!(
                "unexpected protocol version {:#04x}",
                method[0]
            )));
        }
        match method[1] {
            METHOD_NONE => {}
            METHOD_USERPASS => {
                let (user, pass) = match (&cfg.username, &cfg.password) {
                    (Some(u), Some(p)) => (u.as_str(), p.as_str()),
                    _ => {
                        return Err(SockError::Socks(
                            "server requires credentials but none are configured".into(),
                        ))
                    }
                };
                self.send_exact(&socks5_auth_request(user, pass)?).await?;
                if ctl.has_timedout() {
                    return Err(SockError::Timeout(Direction::Read));
                }
                let mut status = [0u8; 2];
                self.recv_exact(&mut status).await?;
                if status[1] != 0x00 {
                    return Err(SockError::Socks("authentication rejected".into()));
                }
            }
            METHOD_UNACCEPTABLE => {
                return Err(SockError::Socks("no acceptable authentication method".into()))
            }
            other => {
                return Err(SockError::Socks(format!(
                    "server selected unsupported method {other:#04x}"
                )))
            }
        }

        self.send_exact(&socks5_connect_request(target)).await?;
        if ctl.has_timedout() {
            return Err(SockError::Timeout(Direction::Read));
        }
        // VER REP RSV ATYP plus the first byte of the bound address (or
        // the domain length octet).
        let mut head = [0u8; 5];
        self.recv_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            return Err(SockError::Socks(format!(
                "unexpected protocol version {:#04x}",
                head[0]
            )));
        }
        if head[1] != 0x00 {
            return Err(SockError::Socks(format!(
                "connect rejected: {}",
                socks5_reply_message(head[1])
            )));
        }
        let rest_len = socks5_bound_len(head[3], head[4])?;
        let mut rest = vec![0u8; rest_len];
        self.recv_exact(&mut rest).await?;
        let port = &rest[rest_len - 2..];
        Ok(socks5_bound_addr(
            head[3],
            head[4],
            &rest[..rest_len - 2],
            port,
        ))
    }

    /// Issue an HTTP CONNECT for `host:port` and wait for a 2xx reply.
    /// Tunnel bytes that arrive in the same read as the response head are
    /// kept in the stream buffer for the next receive.
    pub(crate) async fn http_connect_handshake(
        &mut self,
        cfg: &HttpProxyConfig,
        host: &str,
        port: u16,
        ctl: &TimeoutController,
    ) -> Result<(), SockError> {
        let request = {
            let wb = self.get_write_buffer();
            wb.clear();
            http_connect_request(cfg, host, port, wb);
            wb.split().freeze()
        };
        self.send_exact(&request).await?;

        let mut response = BytesMut::with_capacity(1024);
        let head_end = loop {
            if ctl.has_timedout() {
                return Err(SockError::Timeout(Direction::Read));
            }
            if let Some(pos) = response.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            if response.len() > MAX_CONNECT_RESPONSE {
                return Err(SockError::HttpConnect {
                    status: 0,
                    message: "response head exceeds size limit".into(),
                });
            }
            let mut chunk = [0u8; 2048];
            let n = self.recv_direct(&mut chunk).await?;
            if n == 0 {
                return Err(SockError::ConnectionClosed);
            }
            response.extend_from_slice(&chunk[..n]);
        };

        let (status, reason) = http_connect_status(&response[..head_end])?;
        if !(200..300).contains(&status) {
            return Err(SockError::HttpConnect {
                status,
                message: reason,
            });
        }
        // Anything past the blank line already belongs to the tunnel.
        if head_end < response.len() {
            self.get_read_buffer()
                .extend_from_slice(&response[head_end..]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_advertises_requested_method() {
        assert_eq!(socks5_greeting(false), [0x05, 0x01, 0x00]);
        assert_eq!(socks5_greeting(true), [0x05, 0x01, 0x02]);
    }

    #[test]
    fn auth_request_layout() {
        let buf = socks5_auth_request("user", "pass").unwrap();
        assert_eq!(buf[0], 0x01);
        assert_eq!(buf[1], 4);
        assert_eq!(&buf[2..6], b"user");
        assert_eq!(buf[6], 4);
        assert_eq!(&buf[7..], b"pass");

        let long = "x".repeat(256);
        assert!(socks5_auth_request(&long, "p").is_err());
    }

    #[test]
    fn connect_request_uses_domain_atyp_for_names() {
        let t = TargetAddr::new("example.com", 443).unwrap();
        let buf = socks5_connect_request(&t);
        assert_eq!(&buf[..3], &[0x05, 0x01, 0x00]);
        assert_eq!(buf[3], ATYP_DOMAIN);
        assert_eq!(buf[4], 11);
        assert_eq!(&buf[5..16], b"example.com");
        assert_eq!(&buf[16..], &443u16.to_be_bytes());
    }

    #[test]
    fn connect_request_uses_ip_atyp_for_literals() {
        let t = TargetAddr::new("127.0.0.1", 8080).unwrap();
        let buf = socks5_connect_request(&t);
        assert_eq!(buf[3], ATYP_IPV4);
        assert_eq!(&buf[4..8], &[127, 0, 0, 1]);
        assert_eq!(&buf[8..], &8080u16.to_be_bytes());

        let t6 = TargetAddr::new("::1", 53).unwrap();
        let buf6 = socks5_connect_request(&t6);
        assert_eq!(buf6[3], ATYP_IPV6);
        assert_eq!(buf6.len(), 4 + 16 + 2);
    }

    #[test]
    fn target_host_length_is_bounded() {
        assert!(TargetAddr::new("", 1).is_err());
        assert!(TargetAddr::new(&"h".repeat(256), 1).is_err());
        assert!(TargetAddr::new(&"h".repeat(255), 1).is_ok());
    }

    #[test]
    fn bound_addr_parsing() {
        // IPv4 10.0.0.1:4242, with `first` holding the leading octet.
        let addr = socks5_bound_addr(ATYP_IPV4, 10, &[0, 0, 1], &4242u16.to_be_bytes());
        assert_eq!(addr, Some("10.0.0.1:4242".parse().unwrap()));
        // Domain-typed bound addresses have no socket form.
        assert_eq!(socks5_bound_addr(ATYP_DOMAIN, 7, &[], &[0, 80]), None);
    }

    #[test]
    fn connect_status_parsing() {
        let (status, reason) =
            http_connect_status(b"HTTP/1.1 200 Connection established\r\n\r\n").unwrap();
        assert_eq!(status, 200);
        assert_eq!(reason, "Connection established");

        let (status, _) = http_connect_status(b"HTTP/1.0 407 Proxy Auth Required\r\n").unwrap();
        assert_eq!(status, 407);

        assert!(http_connect_status(b"SSH-2.0-OpenSSH\r\n").is_err());
    }

    #[test]
    fn connect_request_carries_basic_credentials() {
        let cfg = HttpProxyConfig::new("proxy", 3128).with_credentials("user", "pass");
        let mut out = BytesMut::new();
        http_connect_request(&cfg, "example.com", 443, &mut out);
        let text = String::from_utf8(out.to_vec()).unwrap();
        assert!(text.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(text.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
