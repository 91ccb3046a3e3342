//! The connection object.
//!
//! One [`Connection`] owns one non-blocking descriptor and presents
//! blocking-looking operations over it. When a syscall reports
//! would-block, the calling task suspends until the reactor reports
//! readiness for the needed direction or the phase's deadline expires;
//! the syscall is then retried. Would-block itself is never surfaced.
//!
//! The descriptor, buffers, and error state are only ever mutated by the
//! task holding the relevant binding slot; `Connection` methods take
//! `&mut self`, and [`binding`](crate::socket::binding) additionally
//! detects dynamic misuse.

use std::io::{self, IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::os::unix::fs::FileExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use socket2::{SockAddr, Socket};
use tokio::io::unix::AsyncFd;

use crate::base::config::SocketConfig;
use crate::base::error::SockError;
use crate::socket::addr::SocketKind;
use crate::socket::binding::{BindingSlots, Direction};
use crate::socket::frame::FrameConfig;
use crate::socket::proxy::{ProxyConfig, TargetAddr};
use crate::socket::timeout::{Phase, Slot, TimeoutController, TimeoutTable, TimeoutValue};
use crate::socket::tls::{TlsConfig, TlsSession, TlsState};

const READ_CHUNK: usize = 8 * 1024;
const SENDFILE_CHUNK: usize = 256 * 1024;

/// A logical connection over one non-blocking descriptor.
///
/// Created fresh from a [`SocketKind`], or by wrapping an accepted or
/// pre-existing descriptor. Must be constructed inside a tokio runtime
/// (the descriptor is registered with the reactor at construction).
pub struct Connection {
    io: Option<AsyncFd<Socket>>,
    kind: SocketKind,
    closed: bool,
    shutdown_read: bool,
    shutdown_write: bool,
    last_err: Option<(i32, String)>,
    local: Option<SockAddr>,
    peer: Option<SockAddr>,
    peer_host: Option<String>,
    read_buf: Option<BytesMut>,
    write_buf: Option<BytesMut>,
    frame: FrameConfig,
    timeouts: Arc<TimeoutTable>,
    binding: Arc<BindingSlots>,
    proxy: Option<ProxyConfig>,
    proxy_bound: Option<SocketAddr>,
    pub(crate) tls_config: Option<TlsConfig>,
    pub(crate) tls: Option<TlsSession>,
    pub(crate) tls_state: TlsState,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.get_fd())
            .field("kind", &self.kind)
            .field("closed", &self.closed)
            .field("tls", &self.tls_state)
            .finish()
    }
}

fn cvt(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn raw_recv(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> io::Result<usize> {
    cvt(unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), flags) })
}

fn raw_send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    cvt(unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), libc::MSG_NOSIGNAL) })
}

fn raw_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    cvt(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) })
}

fn raw_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    cvt(unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) })
}

fn connect_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS)
}

impl Connection {
    /// Create a fresh, unconnected socket of the given kind.
    pub fn new(kind: SocketKind, config: SocketConfig) -> Result<Self, SockError> {
        let sock = Socket::new(kind.domain(), kind.socket_type(), kind.protocol())?;
        Self::build(sock, kind, config)
    }

    /// Create from raw `(domain, type, protocol)` values.
    pub fn from_parts(
        domain: i32,
        ty: i32,
        protocol: i32,
        config: SocketConfig,
    ) -> Result<Self, SockError> {
        Self::new(SocketKind::from_parts(domain, ty, protocol), config)
    }

    /// Wrap an already-open descriptor (e.g. one accepted elsewhere).
    ///
    /// # Safety
    ///
    /// `fd` must be a valid, exclusively-owned socket descriptor matching
    /// `kind`; ownership transfers to the connection.
    pub unsafe fn from_raw_fd(
        fd: RawFd,
        kind: SocketKind,
        config: SocketConfig,
    ) -> Result<Self, SockError> {
        let sock = Socket::from_raw_fd(fd);
        Self::build(sock, kind, config)
    }

    fn build(sock: Socket, kind: SocketKind, config: SocketConfig) -> Result<Self, SockError> {
        sock.set_nonblocking(true)?;
        if kind.is_stream() && !kind.is_unix() {
            // Disable send coalescing on TCP by default.
            let _ = sock.set_nodelay(true);
        }
        let io = AsyncFd::new(sock)?;
        Ok(Self {
            io: Some(io),
            kind,
            closed: false,
            shutdown_read: false,
            shutdown_write: false,
            last_err: None,
            local: None,
            peer: None,
            peer_host: None,
            read_buf: None,
            write_buf: None,
            frame: config.frame,
            timeouts: Arc::new(TimeoutTable::new(
                config.connect_timeout,
                config.read_timeout,
                config.write_timeout,
            )),
            binding: BindingSlots::new(),
            proxy: None,
            proxy_bound: None,
            tls_config: None,
            tls: None,
            tls_state: TlsState::NotStarted,
        })
    }

    fn from_accepted(sock: Socket, peer: SockAddr, parent: &Connection) -> Result<Self, SockError> {
        let (connect, read, write) = parent.timeouts.snapshot();
        let mut conn = Self::build(
            sock,
            parent.kind,
            SocketConfig {
                connect_timeout: connect,
                read_timeout: read,
                write_timeout: write,
                frame: parent.frame.clone(),
            },
        )?;
        conn.tls_config = parent.tls_config.clone();
        conn.local = conn.io.as_ref().and_then(|io| io.get_ref().local_addr().ok());
        conn.peer = Some(peer);
        Ok(conn)
    }

    // --- accessors -------------------------------------------------------

    /// Raw descriptor, or `-1` when the socket has been closed.
    pub fn get_fd(&self) -> RawFd {
        self.io
            .as_ref()
            .map(|io| io.get_ref().as_raw_fd())
            .unwrap_or(-1)
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local.as_ref().and_then(|a| a.as_socket())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer.as_ref().and_then(|a| a.as_socket())
    }

    /// Address the proxy reported as bound in its reply, when a SOCKS5
    /// tunnel was negotiated.
    pub fn proxy_bound_addr(&self) -> Option<SocketAddr> {
        self.proxy_bound
    }

    /// The last error recorded on this connection (code + message). Set
    /// by every failing operation, cleared by the next successful one.
    pub fn last_error(&self) -> Option<(i32, &str)> {
        self.last_err.as_ref().map(|(c, m)| (*c, m.as_str()))
    }

    pub fn err_code(&self) -> i32 {
        self.last_err.as_ref().map(|(c, _)| *c).unwrap_or(0)
    }

    pub fn set_timeout(&mut self, value: TimeoutValue, phase: Phase) {
        self.timeouts.set(value, phase);
    }

    pub fn get_timeout(&self, phase: Phase) -> TimeoutValue {
        self.timeouts.get_phase(phase)
    }

    pub fn set_frame(&mut self, frame: FrameConfig) {
        self.frame = frame;
    }

    pub fn frame(&self) -> &FrameConfig {
        &self.frame
    }

    /// Configure a forward proxy. At most one proxy is active; a later
    /// call replaces the earlier configuration.
    pub fn set_proxy(&mut self, proxy: ProxyConfig) {
        self.proxy = Some(proxy);
    }

    pub fn set_tls(&mut self, tls: TlsConfig) {
        self.tls_config = Some(tls);
    }

    pub fn tls_state(&self) -> TlsState {
        self.tls_state
    }

    /// Lazily-allocated read buffer; holds tunnel bytes that arrived with
    /// a proxy reply and partial frames between `recv_packet` calls.
    pub fn get_read_buffer(&mut self) -> &mut BytesMut {
        self.read_buf
            .get_or_insert_with(|| BytesMut::with_capacity(READ_CHUNK))
    }

    /// Lazily-allocated write buffer, used to assemble outgoing
    /// negotiation payloads.
    pub fn get_write_buffer(&mut self) -> &mut BytesMut {
        self.write_buf
            .get_or_insert_with(|| BytesMut::with_capacity(READ_CHUNK))
    }

    /// Set an arbitrary integer socket option.
    pub fn set_option(&mut self, level: i32, name: i32, value: i32) -> Result<(), SockError> {
        let res = (|| {
            let fd = self.require_fd()?;
            let ret = unsafe {
                libc::setsockopt(
                    fd,
                    level,
                    name,
                    &value as *const i32 as *const libc::c_void,
                    std::mem::size_of::<i32>() as libc::socklen_t,
                )
            };
            if ret != 0 {
                return Err(SockError::Io(io::Error::last_os_error()));
            }
            Ok(())
        })();
        self.seal(res)
    }

    // --- error bookkeeping ----------------------------------------------

    pub(crate) fn seal<T>(&mut self, res: Result<T, SockError>) -> Result<T, SockError> {
        match &res {
            Ok(_) => self.last_err = None,
            Err(e) => self.last_err = Some((e.os_code(), e.to_string())),
        }
        res
    }

    pub(crate) fn require_fd(&self) -> Result<RawFd, SockError> {
        match self.get_fd() {
            -1 => Err(SockError::NotConnected),
            fd => Ok(fd),
        }
    }

    // --- suspend/resume core --------------------------------------------

    /// Suspend until the descriptor is ready for `dir`, bounded by
    /// `timeout`. Exactly one outcome per call: ready (`Ok`), timed out,
    /// or the wait failed because the descriptor is gone.
    ///
    /// The caller must hold the binding slot for `dir`.
    pub(crate) async fn wait_ready(
        &self,
        dir: Direction,
        timeout: TimeoutValue,
    ) -> Result<(), SockError> {
        let io = self.io.as_ref().ok_or(SockError::NotConnected)?;
        let wait = async {
            match dir {
                Direction::Read => {
                    let mut guard = io.readable().await?;
                    guard.clear_ready();
                }
                Direction::Write => {
                    let mut guard = io.writable().await?;
                    guard.clear_ready();
                }
            }
            Ok::<(), io::Error>(())
        };
        match timeout.deadline() {
            Some(d) => tokio::time::timeout(d, wait)
                .await
                .map_err(|_| SockError::Timeout(dir))??,
            None => wait.await?,
        }
        Ok(())
    }

    /// Attempt `op`; on would-block, bind the direction, suspend until
    /// readiness or deadline, and retry. The binding slot is claimed
    /// before the first syscall attempt and held for the whole cycle.
    async fn io_loop<T>(
        &mut self,
        dir: Direction,
        mut op: impl FnMut(&Socket) -> io::Result<T>,
    ) -> Result<T, SockError> {
        if self.closed {
            return Err(SockError::ConnectionReset);
        }
        let fd = self.require_fd()?;
        let _bound = self.binding.bind(dir, fd)?;
        loop {
            let sock = self
                .io
                .as_ref()
                .ok_or(SockError::NotConnected)?
                .get_ref();
            match op(sock) {
                Ok(v) => return Ok(v),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let t = self.timeouts.get(dir.slot());
                    self.wait_ready(dir, t).await?;
                }
                Err(e) => return Err(SockError::Io(e)),
            }
        }
    }

    // --- connect / listen / accept --------------------------------------

    /// Establish the logical connection: resolve, raw connect, then any
    /// configured proxy negotiation and TLS handshake, all under one
    /// connect-phase deadline.
    ///
    /// A failure during proxy negotiation or the TLS stage closes the
    /// connection: a half-negotiated tunnel or an unverified session is
    /// never left usable.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<(), SockError> {
        let res = self.connect_inner(host, port).await;
        self.seal(res)
    }

    async fn connect_inner(&mut self, host: &str, port: u16) -> Result<(), SockError> {
        if self.closed {
            return Err(SockError::ConnectionReset);
        }
        let budget = self.timeouts.get(Slot::Connect);
        // The whole establishment sequence shares the connect budget:
        // the controller re-arms read/write with the residual before
        // every subsequent wait.
        let ctl = TimeoutController::start(self.timeouts.clone(), budget, Phase::ReadWrite);

        self.peer_host = Some(host.to_string());
        let (connect_host, connect_port) = match &self.proxy {
            Some(p) => (p.host().to_string(), p.port()),
            None => (host.to_string(), port),
        };
        let addr = self.resolve(&connect_host, connect_port, budget).await?;

        tracing::debug!(host = %connect_host, port = connect_port, fd = self.get_fd(), "connecting");
        let pending = {
            let sock = self.io.as_ref().ok_or(SockError::NotConnected)?.get_ref();
            match sock.connect(&addr) {
                Ok(()) => false,
                Err(e) if connect_in_progress(&e) => true,
                Err(e) => return Err(SockError::Io(e)),
            }
        };
        if pending {
            if ctl.has_timedout() {
                return Err(SockError::Timeout(Direction::Write));
            }
            let fd = self.require_fd()?;
            let bound = self.binding.bind(Direction::Write, fd)?;
            self.wait_ready(Direction::Write, self.timeouts.get(Slot::Write))
                .await?;
            drop(bound);
            let sock = self.io.as_ref().ok_or(SockError::NotConnected)?.get_ref();
            if let Some(err) = sock.take_error()? {
                return Err(SockError::Io(err));
            }
        }
        {
            let sock = self.io.as_ref().ok_or(SockError::NotConnected)?.get_ref();
            self.local = sock.local_addr().ok();
            self.peer = sock.peer_addr().ok();
        }

        if let Some(proxy) = self.proxy.clone() {
            if ctl.has_timedout() {
                return Err(SockError::Timeout(Direction::Write));
            }
            let target = TargetAddr::new(host, port)?;
            let negotiated = match proxy {
                ProxyConfig::Socks5(cfg) => {
                    match self.socks5_handshake(&cfg, &target, &ctl).await {
                        Ok(bound) => {
                            self.proxy_bound = bound;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                ProxyConfig::HttpConnect(cfg) => {
                    self.http_connect_handshake(&cfg, host, port, &ctl).await
                }
            };
            if let Err(e) = negotiated {
                // A half-negotiated tunnel must not be reused.
                self.close();
                return Err(e);
            }
            tracing::debug!(fd = self.get_fd(), "proxy tunnel established");
        }

        if let Some(tls) = self.tls_config.clone() {
            if ctl.has_timedout() {
                return Err(SockError::Timeout(Direction::Write));
            }
            if let Err(e) = self.tls_handshake_inner().await {
                self.close();
                return Err(e);
            }
            if tls.verify_peer {
                if let Err(e) = self.tls_verify_inner(tls.allow_self_signed) {
                    // Never leave an unverified session usable.
                    self.close();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn resolve(
        &self,
        host: &str,
        port: u16,
        budget: TimeoutValue,
    ) -> Result<SockAddr, SockError> {
        if self.kind.is_unix() {
            return Ok(SockAddr::unix(host)?);
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SockAddr::from(SocketAddr::new(ip, port)));
        }
        let lookup = tokio::net::lookup_host((host, port));
        let addrs = match budget.deadline() {
            Some(d) => tokio::time::timeout(d, lookup)
                .await
                .map_err(|_| SockError::Timeout(Direction::Write))??,
            None => lookup.await?,
        };
        let want_v6 = self.kind.is_ipv6();
        for a in addrs {
            if a.is_ipv6() == want_v6 {
                return Ok(SockAddr::from(a));
            }
        }
        Err(SockError::ResolveFailed(host.to_string()))
    }

    /// Bind the local address. For Unix kinds, `address` is a filesystem
    /// path and `port` is ignored.
    pub fn bind(&mut self, address: &str, port: u16) -> Result<(), SockError> {
        let res = (|| {
            let addr = if self.kind.is_unix() {
                SockAddr::unix(address)?
            } else {
                let ip: IpAddr = address
                    .parse()
                    .map_err(|_| SockError::InvalidAddress(address.to_string()))?;
                SockAddr::from(SocketAddr::new(ip, port))
            };
            let sock = self.io.as_ref().ok_or(SockError::NotConnected)?.get_ref();
            sock.bind(&addr)?;
            self.local = sock.local_addr().ok();
            Ok(())
        })();
        self.seal(res)
    }

    pub fn listen(&mut self, backlog: i32) -> Result<(), SockError> {
        let res = (|| {
            let sock = self.io.as_ref().ok_or(SockError::NotConnected)?.get_ref();
            sock.listen(if backlog > 0 { backlog } else { 128 })?;
            Ok(())
        })();
        self.seal(res)
    }

    /// Accept one connection, suspending until a peer arrives or the
    /// read deadline expires. The accepted connection inherits timeouts,
    /// framing, and TLS configuration; for TLS servers, follow up with
    /// [`tls_accept`](Self::tls_accept) on the returned connection.
    pub async fn accept(&mut self) -> Result<Connection, SockError> {
        let res = self.accept_inner().await;
        self.seal(res)
    }

    async fn accept_inner(&mut self) -> Result<Connection, SockError> {
        let (sock, peer) = self.io_loop(Direction::Read, |s| s.accept()).await?;
        Connection::from_accepted(sock, peer, self)
    }

    // --- shutdown / close ------------------------------------------------

    pub fn shutdown(&mut self, how: Shutdown) -> Result<(), SockError> {
        let res = (|| {
            let sock = self.io.as_ref().ok_or(SockError::NotConnected)?.get_ref();
            sock.shutdown(how)?;
            match how {
                Shutdown::Read => self.shutdown_read = true,
                Shutdown::Write => self.shutdown_write = true,
                Shutdown::Both => {
                    self.shutdown_read = true;
                    self.shutdown_write = true;
                }
            }
            Ok(())
        })();
        self.seal(res)
    }

    /// Whether the given side(s) have been shut down on this end.
    pub fn is_shutdown(&self, how: Shutdown) -> bool {
        match how {
            Shutdown::Read => self.shutdown_read,
            Shutdown::Write => self.shutdown_write,
            Shutdown::Both => self.shutdown_read && self.shutdown_write,
        }
    }

    /// Close the descriptor. Idempotent; returns whether this call
    /// performed the close. Any later wait fails with a reset error.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        if let Some(mut session) = self.tls.take() {
            let _ = session.stream.shutdown();
        }
        self.tls_state = TlsState::NotStarted;
        self.io = None;
        self.closed = true;
        true
    }

    // --- single-attempt transfers ----------------------------------------

    /// Receive once. Routed through the TLS record layer when a session
    /// is established; drains buffered tunnel/frame bytes first.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, SockError> {
        let res = self.recv_inner(buf).await;
        self.seal(res)
    }

    pub(crate) async fn recv_inner(&mut self, buf: &mut [u8]) -> Result<usize, SockError> {
        if let Some(rb) = self.read_buf.as_mut() {
            if !rb.is_empty() {
                let n = rb.len().min(buf.len());
                buf[..n].copy_from_slice(&rb[..n]);
                rb.advance(n);
                return Ok(n);
            }
        }
        self.recv_direct(buf).await
    }

    /// Receive from the transport, bypassing the stream buffer.
    pub(crate) async fn recv_direct(&mut self, buf: &mut [u8]) -> Result<usize, SockError> {
        if self.tls_established() {
            return self.tls_recv(buf).await;
        }
        self.io_loop(Direction::Read, |s| raw_recv(s.as_raw_fd(), buf, 0))
            .await
    }

    /// Send once. Routed through the TLS record layer when established.
    pub async fn send(&mut self, buf: &[u8]) -> Result<usize, SockError> {
        let res = self.send_inner(buf).await;
        self.seal(res)
    }

    pub(crate) async fn send_inner(&mut self, buf: &[u8]) -> Result<usize, SockError> {
        if self.tls_established() {
            return self.tls_send(buf).await;
        }
        self.io_loop(Direction::Write, |s| raw_send(s.as_raw_fd(), buf))
            .await
    }

    /// Look at pending bytes without consuming them. Always operates on
    /// the raw descriptor, even under TLS.
    pub async fn peek(&mut self, buf: &mut [u8]) -> Result<usize, SockError> {
        let res = self
            .io_loop(Direction::Read, |s| {
                raw_recv(s.as_raw_fd(), buf, libc::MSG_PEEK)
            })
            .await;
        self.seal(res)
    }

    /// `read(2)` on the raw descriptor; not TLS-routed.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SockError> {
        let res = self
            .io_loop(Direction::Read, |s| raw_read(s.as_raw_fd(), buf))
            .await;
        self.seal(res)
    }

    /// `write(2)` on the raw descriptor; not TLS-routed.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, SockError> {
        let res = self
            .io_loop(Direction::Write, |s| raw_write(s.as_raw_fd(), buf))
            .await;
        self.seal(res)
    }

    /// Scatter read into multiple buffers, one syscall attempt.
    pub async fn recv_vectored(
        &mut self,
        bufs: &mut [IoSliceMut<'_>],
    ) -> Result<usize, SockError> {
        let iovcnt = bufs.len().min(libc::c_int::MAX as usize) as libc::c_int;
        let res = self
            .io_loop(Direction::Read, |s| {
                let iov = bufs.as_mut_ptr() as *mut libc::iovec;
                cvt(unsafe { libc::readv(s.as_raw_fd(), iov, iovcnt) })
            })
            .await;
        self.seal(res)
    }

    /// Gather write from multiple buffers, one syscall attempt.
    pub async fn send_vectored(&mut self, bufs: &[IoSlice<'_>]) -> Result<usize, SockError> {
        let iovcnt = bufs.len().min(libc::c_int::MAX as usize) as libc::c_int;
        let res = self
            .io_loop(Direction::Write, |s| {
                let iov = bufs.as_ptr() as *const libc::iovec;
                cvt(unsafe { libc::writev(s.as_raw_fd(), iov, iovcnt) })
            })
            .await;
        self.seal(res)
    }

    // --- exact-count transfers -------------------------------------------

    /// Receive exactly `buf.len()` bytes or fail. A short transfer is
    /// never reported as success: peer close mid-fill is
    /// [`SockError::ConnectionClosed`]. The whole transfer consumes one
    /// read budget; a peer trickling bytes does not reset the deadline.
    pub async fn recv_all(&mut self, buf: &mut [u8]) -> Result<usize, SockError> {
        let res = self.recv_exact(buf).await.map(|()| buf.len());
        self.seal(res)
    }

    pub(crate) async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<(), SockError> {
        let budget = self.timeouts.get(Slot::Read);
        let ctl = TimeoutController::start(self.timeouts.clone(), budget, Phase::Read);
        let mut done = 0;
        while done < buf.len() {
            if ctl.has_timedout() {
                return Err(SockError::Timeout(Direction::Read));
            }
            let n = self.recv_inner(&mut buf[done..]).await?;
            if n == 0 {
                return Err(SockError::ConnectionClosed);
            }
            done += n;
        }
        Ok(())
    }

    /// Send exactly `buf.len()` bytes or fail. As with
    /// [`recv_all`](Self::recv_all), the deadline spans the whole
    /// transfer.
    pub async fn send_all(&mut self, buf: &[u8]) -> Result<usize, SockError> {
        let res = self.send_exact(buf).await.map(|()| buf.len());
        self.seal(res)
    }

    pub(crate) async fn send_exact(&mut self, buf: &[u8]) -> Result<(), SockError> {
        let budget = self.timeouts.get(Slot::Write);
        let ctl = TimeoutController::start(self.timeouts.clone(), budget, Phase::Write);
        let mut done = 0;
        while done < buf.len() {
            if ctl.has_timedout() {
                return Err(SockError::Timeout(Direction::Write));
            }
            let n = self.send_inner(&buf[done..]).await?;
            if n == 0 {
                return Err(SockError::ConnectionClosed);
            }
            done += n;
        }
        Ok(())
    }

    // --- framing ----------------------------------------------------------

    /// Receive one complete length-prefixed frame (header plus body) as
    /// configured by [`FrameConfig`]. `timeout` overrides the read
    /// deadline for this call; the budget spans header and body
    /// accumulation as one deadline. A header declaring a body beyond the
    /// configured maximum is rejected before any body byte is read, and a
    /// partial frame is never returned.
    pub async fn recv_packet(&mut self, timeout: Option<TimeoutValue>) -> Result<Bytes, SockError> {
        let res = self.recv_packet_inner(timeout).await;
        self.seal(res)
    }

    async fn recv_packet_inner(&mut self, timeout: Option<TimeoutValue>) -> Result<Bytes, SockError> {
        let frame = self.frame.clone();
        frame.validate()?;
        let budget = timeout.unwrap_or(self.timeouts.get(Slot::Read));
        let ctl = TimeoutController::start(self.timeouts.clone(), budget, Phase::Read);

        let header_len = frame.header_len();
        while self.buffered() < header_len {
            self.fill_read_buf(&ctl).await?;
        }
        let body_len = {
            let rb = self.get_read_buffer();
            let header = &rb[..header_len];
            frame.decode_body_len(header)?
        };
        let total = header_len + body_len;
        while self.buffered() < total {
            self.fill_read_buf(&ctl).await?;
        }
        Ok(self.get_read_buffer().split_to(total).freeze())
    }

    fn buffered(&self) -> usize {
        self.read_buf.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    async fn fill_read_buf(&mut self, ctl: &TimeoutController) -> Result<(), SockError> {
        if ctl.has_timedout() {
            return Err(SockError::Timeout(Direction::Read));
        }
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.recv_direct(&mut chunk).await?;
        if n == 0 {
            return Err(SockError::ConnectionClosed);
        }
        self.get_read_buffer().extend_from_slice(&chunk[..n]);
        Ok(())
    }

    // --- datagram path ----------------------------------------------------

    /// Send one datagram to an explicit destination. For Unix kinds,
    /// `host` is a filesystem path.
    pub async fn sendto(&mut self, host: &str, port: u16, data: &[u8]) -> Result<usize, SockError> {
        let res = (async {
            let addr = self
                .resolve(host, port, self.timeouts.get(Slot::Write))
                .await?;
            self.io_loop(Direction::Write, |s| s.send_to(data, &addr))
                .await
        })
        .await;
        self.seal(res)
    }

    /// Receive one datagram, returning the sender's address when it has
    /// an IP form.
    pub async fn recvfrom(
        &mut self,
        buf: &mut [u8],
    ) -> Result<(usize, Option<SocketAddr>), SockError> {
        let res = self
            .io_loop(Direction::Read, |s| {
                // recv_from fills the buffer before we read it back; the
                // MaybeUninit view is the socket2 calling convention.
                let uninit = unsafe {
                    std::slice::from_raw_parts_mut(
                        buf.as_mut_ptr() as *mut MaybeUninit<u8>,
                        buf.len(),
                    )
                };
                s.recv_from(uninit)
            })
            .await
            .map(|(n, addr)| (n, addr.as_socket()));
        self.seal(res)
    }

    // --- sendfile ---------------------------------------------------------

    /// Transfer `length` bytes of `file` starting at `offset` to the
    /// connection. Uses `sendfile(2)` on the plain path; falls back to
    /// buffered copies under TLS.
    pub async fn sendfile(
        &mut self,
        file: &std::fs::File,
        offset: u64,
        length: usize,
    ) -> Result<usize, SockError> {
        let res = (async {
            if length == 0 {
                return Ok(0);
            }
            if self.tls_established() {
                self.sendfile_buffered(file, offset, length).await?;
            } else {
                self.sendfile_raw(file, offset, length).await?;
            }
            Ok(length)
        })
        .await;
        self.seal(res)
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    async fn sendfile_raw(
        &mut self,
        file: &std::fs::File,
        offset: u64,
        length: usize,
    ) -> Result<(), SockError> {
        let mut off = offset as libc::off_t;
        let mut remaining = length;
        while remaining > 0 {
            let chunk = remaining.min(SENDFILE_CHUNK);
            let in_fd = file.as_raw_fd();
            let n = self
                .io_loop(Direction::Write, |s| {
                    cvt(unsafe { libc::sendfile(s.as_raw_fd(), in_fd, &mut off, chunk) })
                })
                .await?;
            if n == 0 {
                return Err(SockError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file range ended before requested length",
                )));
            }
            remaining -= n;
        }
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    async fn sendfile_raw(
        &mut self,
        file: &std::fs::File,
        offset: u64,
        length: usize,
    ) -> Result<(), SockError> {
        self.sendfile_buffered(file, offset, length).await
    }

    async fn sendfile_buffered(
        &mut self,
        file: &std::fs::File,
        offset: u64,
        length: usize,
    ) -> Result<(), SockError> {
        let mut buf = vec![0u8; 64 * 1024];
        let mut off = offset;
        let mut remaining = length;
        while remaining > 0 {
            let want = remaining.min(buf.len());
            let n = file.read_at(&mut buf[..want], off)?;
            if n == 0 {
                return Err(SockError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file range ended before requested length",
                )));
            }
            self.send_exact(&buf[..n]).await?;
            off += n as u64;
            remaining -= n;
        }
        Ok(())
    }

    // --- internals shared with proxy/tls ---------------------------------

    pub(crate) fn timeouts(&self) -> &Arc<TimeoutTable> {
        &self.timeouts
    }

    pub(crate) fn binding(&self) -> &Arc<BindingSlots> {
        &self.binding
    }

    pub(crate) fn tls_established(&self) -> bool {
        matches!(self.tls_state, TlsState::Established)
    }

    pub(crate) fn peer_host(&self) -> Option<&str> {
        self.peer_host.as_deref()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
