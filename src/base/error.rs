use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

use crate::socket::binding::Direction;

/// Crate-wide error type.
///
/// Three families of failures, surfaced as distinct variants so callers
/// can tell them apart:
///
/// - transient outcomes: [`SockError::Timeout`] ("no data yet"),
///   [`SockError::ConnectionReset`] and [`SockError::ConnectionClosed`]
///   ("connection broken"). Would-block is absorbed internally by
///   suspension and never surfaced.
/// - protocol failures: proxy negotiation, TLS handshake/verification,
///   and framing violations. The connection must not be reused after one
///   of these.
/// - programming errors: [`SockError::AlreadyBound`], binding a second
///   task to a direction that is already occupied. Loud and typed, but it
///   no longer terminates the process; the embedder decides.
#[derive(Debug, Error)]
pub enum SockError {
    #[error("operation timed out waiting for {0} readiness")]
    Timeout(Direction),
    #[error("connection reset")]
    ConnectionReset,
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("socket is not connected")]
    NotConnected,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("address resolution failed for {0}")]
    ResolveFailed(String),

    #[error("SOCKS5 proxy: {0}")]
    Socks(String),
    #[error("HTTP CONNECT proxy returned {status}: {message}")]
    HttpConnect { status: u16, message: String },
    #[error("TLS: {0}")]
    Tls(String),
    #[error("TLS verification failed: {0}")]
    TlsVerify(String),
    #[error("frame body length {length} exceeds maximum {max}")]
    FrameTooLarge { length: usize, max: usize },
    #[error("invalid frame configuration: {0}")]
    FrameConfig(String),

    #[error(
        "socket fd {fd}: {direction} side is already bound to another task; \
         using the same direction of one socket from multiple tasks at the \
         same time is not allowed"
    )]
    AlreadyBound { direction: Direction, fd: RawFd },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SockError {
    /// True for the timeout outcome, so callers can distinguish "deadline
    /// elapsed" from "connection broken" without matching every variant.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SockError::Timeout(_))
    }

    /// errno-style code recorded on the connection's last-error pair.
    pub(crate) fn os_code(&self) -> i32 {
        match self {
            SockError::Timeout(_) => libc::ETIMEDOUT,
            SockError::ConnectionReset | SockError::ConnectionClosed => libc::ECONNRESET,
            SockError::NotConnected => libc::ENOTCONN,
            SockError::InvalidAddress(_) | SockError::ResolveFailed(_) => libc::EINVAL,
            SockError::Socks(_)
            | SockError::HttpConnect { .. }
            | SockError::Tls(_)
            | SockError::TlsVerify(_) => libc::ECONNABORTED,
            SockError::FrameTooLarge { .. } | SockError::FrameConfig(_) => libc::EPROTO,
            SockError::AlreadyBound { .. } => libc::EBUSY,
            SockError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
