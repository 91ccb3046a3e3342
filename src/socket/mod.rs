//! The connection object and its supporting machinery.
//!
//! - [`conn`]: the [`Connection`](conn::Connection) type and every I/O
//!   operation on it
//! - [`timeout`]: scoped, restorable per-phase deadline budgets
//! - [`binding`]: the single-reader/single-writer invariant
//! - [`addr`]: socket kinds and address resolution
//! - [`frame`]: length-prefixed packet framing
//! - [`proxy`]: SOCKS5 and HTTP CONNECT forward-proxy negotiation
//! - [`tls`]: TLS handshake, verification, and record-layer I/O

pub mod addr;
pub mod binding;
pub mod conn;
pub mod frame;
pub mod proxy;
pub mod timeout;
pub mod tls;
