//! Keeping real sockets out of the tunnel
//!
//! On Android every socket opened by the VPN app would itself be routed into
//! the tunnel unless it is passed to `VpnService.protect(fd)` first. The host
//! supplies that call as a callback.

use crate::error::{EngineError, Result};
use std::fmt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use tracing::{debug, warn};

/// Socket protect callback type
pub type ProtectCallback = Arc<dyn Fn(RawFd) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct SocketProtector {
    callback: Option<ProtectCallback>,
}

impl SocketProtector {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(RawFd) -> bool + Send + Sync + 'static,
    {
        Self {
            callback: Some(Arc::new(callback)),
        }
    }

    /// Protector that lets every socket through untouched (desktop Linux,
    /// tests).
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.callback.is_some()
    }

    pub fn protect(&self, fd: RawFd) -> bool {
        match &self.callback {
            Some(callback) => {
                let result = callback(fd);
                if result {
                    debug!("Socket fd={} protected successfully", fd);
                } else {
                    warn!("Socket fd={} protection FAILED", fd);
                }
                result
            }
            None => {
                debug!("No protect callback set for socket fd={}, using fallback allow", fd);
                true
            }
        }
    }

    pub fn protect_socket2(&self, socket: &socket2::Socket) -> Result<()> {
        let fd = socket.as_raw_fd();
        if self.protect(fd) {
            Ok(())
        } else {
            Err(EngineError::ProtectFailed(fd))
        }
    }
}

impl fmt::Debug for SocketProtector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketProtector")
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn test_fallback_allows() {
        assert!(SocketProtector::none().protect(42));
        assert!(!SocketProtector::none().is_set());
    }

    #[test]
    fn test_callback_sees_fd() {
        let seen = Arc::new(AtomicI32::new(-1));
        let seen_cb = seen.clone();
        let protector = SocketProtector::new(move |fd| {
            seen_cb.store(fd, Ordering::SeqCst);
            false
        });
        let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, None).unwrap();
        assert!(matches!(
            protector.protect_socket2(&socket),
            Err(EngineError::ProtectFailed(_))
        ));
        assert_eq!(seen.load(Ordering::SeqCst), socket.as_raw_fd());
    }
}
