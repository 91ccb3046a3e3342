use std::time::Duration;

use crate::socket::frame::FrameConfig;
use crate::socket::timeout::TimeoutValue;

/// Per-connection defaults, passed at construction.
///
/// An explicit configuration object instead of process-wide mutable
/// defaults: every connection gets its own copy, overridable afterwards
/// via [`Connection::set_timeout`](crate::Connection::set_timeout) and
/// [`Connection::set_frame`](crate::Connection::set_frame).
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Deadline for `connect`, covering raw connect, proxy negotiation,
    /// and the TLS handshake as one budget.
    pub connect_timeout: TimeoutValue,
    /// Deadline for each read-side wait.
    pub read_timeout: TimeoutValue,
    /// Deadline for each write-side wait.
    pub write_timeout: TimeoutValue,
    /// Length-prefixed framing layout used by `recv_packet`.
    pub frame: FrameConfig,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout: TimeoutValue::Finite(Duration::from_secs(1)),
            read_timeout: TimeoutValue::Infinite,
            write_timeout: TimeoutValue::Infinite,
            frame: FrameConfig::default(),
        }
    }
}
