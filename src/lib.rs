//! # corosock
//!
//! A coroutine-style socket library for Rust.
//!
//! `corosock` presents blocking-looking socket operations (`connect`,
//! `recv`, `send`, `accept`) over non-blocking descriptors. When an
//! operation would block, the calling task is suspended until the
//! descriptor becomes ready or a deadline expires; the host thread is
//! never blocked.
//!
//! ## Features
//!
//! - **One connection object**: TCP (v4/v6), UDP (v4/v6), and Unix
//!   stream/datagram sockets behind a single [`Connection`] type
//! - **Per-phase deadlines**: independent connect/read/write timeout
//!   budgets that survive across multiple suspend/resume cycles
//! - **Single-binding invariant**: at most one task may wait on a
//!   connection's read side and one on its write side, enforced loudly
//! - **Proxy tunneling**: SOCKS5 (no-auth and username/password) and
//!   HTTP CONNECT, negotiated transparently during `connect`
//! - **TLS**: BoringSSL handshake/verify/accept driven through the same
//!   suspend/resume cycle as plain I/O
//! - **Framing**: length-prefixed packet reads with a configurable
//!   header layout and a hard maximum body length
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use corosock::{Connection, SocketConfig, SocketKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), corosock::SockError> {
//!     let mut conn = Connection::new(SocketKind::Tcp, SocketConfig::default())?;
//!     conn.connect("example.com", 80).await?;
//!     conn.send_all(b"GET / HTTP/1.0\r\n\r\n").await?;
//!     let mut buf = [0u8; 4096];
//!     let n = conn.recv(&mut buf).await?;
//!     println!("{}", String::from_utf8_lossy(&buf[..n]));
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Error taxonomy and connection configuration
//! - [`socket`] - The connection object, deadlines, binding, proxy, TLS,
//!   and framing

pub mod base;
pub mod socket;

pub use base::config::SocketConfig;
pub use base::error::SockError;
pub use socket::addr::SocketKind;
pub use socket::binding::Direction;
pub use socket::conn::Connection;
pub use socket::frame::{FrameConfig, LengthOrder};
pub use socket::proxy::{HttpProxyConfig, ProxyConfig, Socks5Config};
pub use socket::timeout::{Phase, TimeoutValue};
pub use socket::tls::{TlsConfig, TlsState};
