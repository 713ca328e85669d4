//! Resolve the uid that owns a local socket.
//!
//! Android assigns every installed application its own uid, so the uid of the
//! socket behind a tunnelled flow identifies the app that opened it. The
//! kernel exposes socket ownership through the `/proc/net` tables, which are
//! scanned here by local port.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    /// `/proc/net` tables to scan, IPv6 first since dual-stack sockets
    /// opened by apps show up there even for IPv4 peers.
    pub fn tables(&self) -> [&'static str; 2] {
        match self {
            Transport::Tcp => ["/proc/net/tcp6", "/proc/net/tcp"],
            Transport::Udp => ["/proc/net/udp6", "/proc/net/udp"],
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Sock2ProcError {
    #[error("No socket bound to local port {0}")]
    SocketNotFound(u16),
    #[error("Malformed /proc/net entry: {0}")]
    MalformedEntry(String),
    #[error("System error: {0}")]
    SystemError(String),
    #[error("Not implemented for this platform")]
    NotImplemented,
}

/// Find the uid owning the socket bound to `local_port`.
pub fn find_uid(transport: Transport, local_port: u16) -> Result<u32, Sock2ProcError> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        platform::linux::find_uid(transport, local_port)
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = (transport, local_port);
        Err(Sock2ProcError::NotImplemented)
    }
}

pub mod utils;

pub use utils::parse_uid;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod platform {
    pub mod linux;
}
