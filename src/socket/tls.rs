//! TLS sessions layered over the raw descriptor.
//!
//! The record layer runs over a blocking-free [`FdIo`] adapter that
//! remembers which direction last reported would-block, so a resumable
//! handshake step or an established-session read/write knows whether to
//! wait for readability or writability before retrying. Renegotiation
//! makes the mapping non-obvious: an application read can require the
//! descriptor to become writable first.
//!
//! Certificate verification is decoupled from the handshake: the
//! handshake itself never rejects a peer, and [`Connection::tls_verify`]
//! checks the recorded chain result afterwards (automatically during
//! `connect` when [`TlsConfig::verify_peer`] is set).

use std::cell::Cell;
use std::io;
use std::os::unix::io::RawFd;

use boring::ssl::{
    ErrorCode, HandshakeError, MidHandshakeSslStream, SslAcceptor, SslConnector, SslFiletype,
    SslMethod, SslStream, SslVerifyMode,
};

use crate::base::error::SockError;
use crate::socket::binding::Direction;
use crate::socket::conn::Connection;

// Chain results accepted when self-signed peers are allowed.
const X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT: i32 = 18;
const X509_V_ERR_SELF_SIGNED_CERT_IN_CHAIN: i32 = 19;

/// TLS settings for one connection, client or server side.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Verify the peer's certificate chain right after the client
    /// handshake, failing `connect` on a bad chain.
    pub verify_peer: bool,
    /// Accept self-signed chains during verification.
    pub allow_self_signed: bool,
    /// Server name to send in the SNI extension; defaults to the
    /// connect host when it is not an IP literal.
    pub sni_hostname: Option<String>,
    /// PEM certificate chain: the server certificate, or an optional
    /// client certificate.
    pub cert_file: Option<String>,
    /// PEM private key matching `cert_file`.
    pub key_file: Option<String>,
    /// Extra PEM CA bundle used for chain verification.
    pub ca_file: Option<String>,
}

/// Where the connection's TLS layer currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    NotStarted,
    Handshaking,
    Established,
    Failed,
}

/// Raw-descriptor I/O for the record layer. Does not own the
/// descriptor; the connection does.
pub(crate) struct FdIo {
    fd: RawFd,
    last_block: Cell<Option<Direction>>,
}

impl FdIo {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            last_block: Cell::new(None),
        }
    }

    pub(crate) fn last_block(&self) -> Option<Direction> {
        self.last_block.get()
    }

    pub(crate) fn clear_block(&self) {
        self.last_block.set(None);
    }
}

impl io::Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::WouldBlock {
                self.last_block.set(Some(Direction::Read));
            }
            return Err(e);
        }
        Ok(n as usize)
    }
}

impl io::Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n =
            unsafe { libc::send(self.fd, buf.as_ptr().cast(), buf.len(), libc::MSG_NOSIGNAL) };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::WouldBlock {
                self.last_block.set(Some(Direction::Write));
            }
            return Err(e);
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// An established (or in-progress) TLS session.
pub(crate) struct TlsSession {
    pub(crate) stream: SslStream<FdIo>,
}

fn tls_err(e: impl std::fmt::Display) -> SockError {
    SockError::Tls(e.to_string())
}

fn build_connector(cfg: &TlsConfig) -> Result<SslConnector, SockError> {
    let mut builder = SslConnector::builder(SslMethod::tls()).map_err(tls_err)?;
    // Verification is a separate, post-handshake step; the handshake
    // itself must complete even against an untrusted peer.
    builder.set_verify(SslVerifyMode::NONE);
    if let Some(ca) = &cfg.ca_file {
        builder.set_ca_file(ca).map_err(tls_err)?;
    }
    if let Some(cert) = &cfg.cert_file {
        builder.set_certificate_chain_file(cert).map_err(tls_err)?;
    }
    if let Some(key) = &cfg.key_file {
        builder
            .set_private_key_file(key, SslFiletype::PEM)
            .map_err(tls_err)?;
    }
    Ok(builder.build())
}

fn build_acceptor(cfg: &TlsConfig) -> Result<SslAcceptor, SockError> {
    let (cert, key) = match (&cfg.cert_file, &cfg.key_file) {
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(SockError::Tls(
                "server role requires a certificate and key".into(),
            ))
        }
    };
    let mut builder =
        SslAcceptor::mozilla_intermediate(SslMethod::tls()).map_err(tls_err)?;
    builder.set_private_key_file(key, SslFiletype::PEM).map_err(tls_err)?;
    builder.set_certificate_chain_file(cert).map_err(tls_err)?;
    if let Some(ca) = &cfg.ca_file {
        builder.set_ca_file(ca).map_err(tls_err)?;
    }
    builder.set_verify(SslVerifyMode::NONE);
    Ok(builder.build())
}

fn want_direction(mid: &MidHandshakeSslStream<FdIo>) -> Direction {
    match mid.error().code() {
        ErrorCode::WANT_WRITE => Direction::Write,
        ErrorCode::WANT_READ => Direction::Read,
        _ => mid.get_ref().last_block().unwrap_or(Direction::Read),
    }
}

impl Connection {
    /// Run the client-side handshake. No-op when a session is already
    /// established. The peer is not authenticated here; follow up with
    /// [`tls_verify`](Self::tls_verify) (done automatically by `connect`
    /// when [`TlsConfig::verify_peer`] is set).
    pub async fn tls_handshake(&mut self) -> Result<(), SockError> {
        let res = self.tls_handshake_inner().await;
        self.seal(res)
    }

    pub(crate) async fn tls_handshake_inner(&mut self) -> Result<(), SockError> {
        if self.tls_established() {
            return Ok(());
        }
        let fd = self.require_fd()?;
        let cfg = self.tls_config.clone().unwrap_or_default();
        let sni = cfg
            .sni_hostname
            .clone()
            .or_else(|| self.peer_host().map(str::to_string))
            .unwrap_or_default();
        let use_sni = !sni.is_empty() && sni.parse::<std::net::IpAddr>().is_err();

        let connector = build_connector(&cfg)?;
        let mut configured = connector.configure().map_err(tls_err)?;
        configured.set_verify(SslVerifyMode::NONE);
        configured.set_verify_hostname(false);
        if !use_sni {
            configured.set_use_server_name_indication(false);
        }
        let sni_label = if use_sni { sni.as_str() } else { "<none>" };
        tracing::debug!(fd, sni = %sni_label, "tls client handshake");
        let first = configured.connect(if use_sni { &sni } else { "" }, FdIo::new(fd));
        self.drive_handshake(first).await
    }

    /// Run the server-side handshake on an accepted connection, using
    /// the certificate and key from [`TlsConfig`].
    pub async fn tls_accept(&mut self) -> Result<(), SockError> {
        let res = self.tls_accept_inner().await;
        self.seal(res)
    }

    async fn tls_accept_inner(&mut self) -> Result<(), SockError> {
        if self.tls_established() {
            return Ok(());
        }
        let fd = self.require_fd()?;
        let cfg = self.tls_config.clone().unwrap_or_default();
        let acceptor = build_acceptor(&cfg)?;
        tracing::debug!(fd, "tls server handshake");
        let first = acceptor.accept(FdIo::new(fd));
        self.drive_handshake(first).await
    }

    /// Step the handshake to completion, suspending on whichever
    /// direction the record layer reports it needs. Both binding slots
    /// are held for the duration: a handshake transfers in both
    /// directions.
    async fn drive_handshake(
        &mut self,
        first: Result<SslStream<FdIo>, HandshakeError<FdIo>>,
    ) -> Result<(), SockError> {
        let fd = self.require_fd()?;
        let _bound_read = self.binding().bind(Direction::Read, fd)?;
        let _bound_write = self.binding().bind(Direction::Write, fd)?;
        self.tls_state = TlsState::Handshaking;

        let mut step = first;
        loop {
            match step {
                Ok(stream) => {
                    self.tls = Some(TlsSession { stream });
                    self.tls_state = TlsState::Established;
                    return Ok(());
                }
                Err(HandshakeError::WouldBlock(mid)) => {
                    let dir = want_direction(&mid);
                    let timeout = self.timeouts().get(dir.slot());
                    if let Err(e) = self.wait_ready(dir, timeout).await {
                        self.tls_state = TlsState::Failed;
                        return Err(e);
                    }
                    step = mid.handshake();
                }
                Err(HandshakeError::Failure(mid)) => {
                    self.tls_state = TlsState::Failed;
                    return Err(SockError::Tls(mid.error().to_string()));
                }
                Err(HandshakeError::SetupFailure(stack)) => {
                    self.tls_state = TlsState::Failed;
                    return Err(tls_err(stack));
                }
            }
        }
    }

    /// Check the certificate chain result recorded during the handshake.
    pub fn tls_verify(&mut self, allow_self_signed: bool) -> Result<(), SockError> {
        let res = self.tls_verify_inner(allow_self_signed);
        self.seal(res)
    }

    pub(crate) fn tls_verify_inner(&mut self, allow_self_signed: bool) -> Result<(), SockError> {
        let session = self.tls.as_ref().ok_or(SockError::NotConnected)?;
        let ssl = session.stream.ssl();
        if ssl.peer_certificate().is_none() {
            return Err(SockError::TlsVerify("peer presented no certificate".into()));
        }
        match ssl.verify_result() {
            Ok(()) => Ok(()),
            Err(err) => match err.as_raw() {
                X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT | X509_V_ERR_SELF_SIGNED_CERT_IN_CHAIN
                    if allow_self_signed =>
                {
                    Ok(())
                }
                _ => Err(SockError::TlsVerify(err.error_string().to_string())),
            },
        }
    }

    /// One receive through the record layer. WANT_WRITE from a
    /// renegotiation temporarily claims the write slot as well.
    pub(crate) async fn tls_recv(&mut self, buf: &mut [u8]) -> Result<usize, SockError> {
        let fd = self.require_fd()?;
        let _bound = self.binding().bind(Direction::Read, fd)?;
        loop {
            let res = {
                let session = self.tls.as_mut().ok_or(SockError::NotConnected)?;
                session.stream.get_ref().clear_block();
                io::Read::read(&mut session.stream, buf)
            };
            match res {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let dir = self.last_tls_block().unwrap_or(Direction::Read);
                    let timeout = self.timeouts().get(dir.slot());
                    if dir == Direction::Write {
                        let _w = self.binding().bind(Direction::Write, fd)?;
                        self.wait_ready(dir, timeout).await?;
                    } else {
                        self.wait_ready(dir, timeout).await?;
                    }
                }
                Err(e) => return Err(SockError::Io(e)),
            }
        }
    }

    /// One send through the record layer. WANT_READ from a renegotiation
    /// temporarily claims the read slot as well.
    pub(crate) async fn tls_send(&mut self, buf: &[u8]) -> Result<usize, SockError> {
        let fd = self.require_fd()?;
        let _bound = self.binding().bind(Direction::Write, fd)?;
        loop {
            let res = {
                let session = self.tls.as_mut().ok_or(SockError::NotConnected)?;
                session.stream.get_ref().clear_block();
                io::Write::write(&mut session.stream, buf)
            };
            match res {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let dir = self.last_tls_block().unwrap_or(Direction::Write);
                    let timeout = self.timeouts().get(dir.slot());
                    if dir == Direction::Read {
                        let _r = self.binding().bind(Direction::Read, fd)?;
                        self.wait_ready(dir, timeout).await?;
                    } else {
                        self.wait_ready(dir, timeout).await?;
                    }
                }
                Err(e) => return Err(SockError::Io(e)),
            }
        }
    }

    fn last_tls_block(&self) -> Option<Direction> {
        self.tls.as_ref().and_then(|s| s.stream.get_ref().last_block())
    }
}
