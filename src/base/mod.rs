//! Base types and error handling.
//!
//! - [`error::SockError`]: the crate-wide error taxonomy
//! - [`config::SocketConfig`]: per-connection defaults (timeouts, framing)

pub mod config;
pub mod error;
