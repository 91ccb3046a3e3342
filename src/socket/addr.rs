//! Socket kinds and addressing.

use socket2::{Domain, Protocol, Type};

/// The transport a [`Connection`](crate::Connection) speaks.
///
/// The kind fixes the address family and socket type for the lifetime of
/// the connection; addresses passed to `connect`/`bind`/`sendto` must
/// match it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    /// TCP over IPv4.
    Tcp,
    /// TCP over IPv6.
    Tcp6,
    /// UDP over IPv4.
    Udp,
    /// UDP over IPv6.
    Udp6,
    /// Unix-domain stream socket (addresses are filesystem paths).
    UnixStream,
    /// Unix-domain datagram socket.
    UnixDgram,
}

impl SocketKind {
    /// Map raw `(domain, type, protocol)` triples onto a kind, defaulting
    /// to TCP for unrecognized domains.
    pub fn from_parts(domain: i32, ty: i32, _protocol: i32) -> SocketKind {
        let stream = ty == libc::SOCK_STREAM;
        match domain {
            libc::AF_INET => {
                if stream {
                    SocketKind::Tcp
                } else {
                    SocketKind::Udp
                }
            }
            libc::AF_INET6 => {
                if stream {
                    SocketKind::Tcp6
                } else {
                    SocketKind::Udp6
                }
            }
            libc::AF_UNIX => {
                if stream {
                    SocketKind::UnixStream
                } else {
                    SocketKind::UnixDgram
                }
            }
            _ => {
                tracing::debug!(domain, ty, "unrecognized socket domain, defaulting to tcp");
                SocketKind::Tcp
            }
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(
            self,
            SocketKind::Tcp | SocketKind::Tcp6 | SocketKind::UnixStream
        )
    }

    pub fn is_datagram(&self) -> bool {
        !self.is_stream()
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, SocketKind::UnixStream | SocketKind::UnixDgram)
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, SocketKind::Tcp6 | SocketKind::Udp6)
    }

    pub(crate) fn domain(&self) -> Domain {
        match self {
            SocketKind::Tcp | SocketKind::Udp => Domain::IPV4,
            SocketKind::Tcp6 | SocketKind::Udp6 => Domain::IPV6,
            SocketKind::UnixStream | SocketKind::UnixDgram => Domain::UNIX,
        }
    }

    pub(crate) fn socket_type(&self) -> Type {
        if self.is_stream() {
            Type::STREAM
        } else {
            Type::DGRAM
        }
    }

    pub(crate) fn protocol(&self) -> Option<Protocol> {
        match self {
            SocketKind::Tcp | SocketKind::Tcp6 => Some(Protocol::TCP),
            SocketKind::Udp | SocketKind::Udp6 => Some(Protocol::UDP),
            SocketKind::UnixStream | SocketKind::UnixDgram => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_parts_maps_families() {
        assert_eq!(
            SocketKind::from_parts(libc::AF_INET, libc::SOCK_STREAM, 0),
            SocketKind::Tcp
        );
        assert_eq!(
            SocketKind::from_parts(libc::AF_INET, libc::SOCK_DGRAM, 0),
            SocketKind::Udp
        );
        assert_eq!(
            SocketKind::from_parts(libc::AF_INET6, libc::SOCK_STREAM, 0),
            SocketKind::Tcp6
        );
        assert_eq!(
            SocketKind::from_parts(libc::AF_UNIX, libc::SOCK_DGRAM, 0),
            SocketKind::UnixDgram
        );
        // Unknown domains fall back to TCP.
        assert_eq!(SocketKind::from_parts(9999, 0, 0), SocketKind::Tcp);
    }

    #[test]
    fn kind_predicates() {
        assert!(SocketKind::Tcp.is_stream());
        assert!(SocketKind::Udp6.is_datagram());
        assert!(SocketKind::UnixStream.is_unix());
        assert!(SocketKind::Tcp6.is_ipv6());
        assert!(!SocketKind::Udp.is_ipv6());
    }
}
