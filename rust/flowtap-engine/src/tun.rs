//! Tunnel descriptor and the reader's interrupt pipe

use crate::error::Result;
use parking_lot::Mutex;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tracing::debug;

/// The VPN tunnel descriptor handed over by the host.
///
/// Every read returns exactly one IPv4 datagram and every write must carry
/// exactly one.
#[derive(Debug)]
pub struct TunDevice {
    fd: OwnedFd,
}

impl TunDevice {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        let n = unsafe { libc::read(self.fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(n as usize)
    }

    pub fn write_packet(&self, data: &[u8]) -> Result<usize> {
        let n = unsafe { libc::write(self.fd(), data.as_ptr() as *const libc::c_void, data.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(n as usize)
    }
}

/// Pipe whose write end is closed to stop the tunnel reader.
///
/// Closing the write end makes the read end report hang-up, which wakes a
/// `poll(2)` blocked on it.
#[derive(Debug)]
pub struct Interrupter {
    read: OwnedFd,
    write: Mutex<Option<OwnedFd>>,
}

impl Interrupter {
    pub fn new() -> Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self {
            read,
            write: Mutex::new(Some(write)),
        })
    }

    /// Descriptor the reader polls alongside the tunnel.
    pub fn fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    pub fn trigger(&self) {
        if self.write.lock().take().is_some() {
            debug!("Tunnel reader interrupt triggered");
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.write.lock().is_none()
    }
}
