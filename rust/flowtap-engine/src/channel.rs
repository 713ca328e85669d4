//! Real sockets backing flows
//!
//! Sockets are created and tuned with socket2, protected from the tunnel,
//! then handed to mio as non-blocking streams.

use crate::error::Result;
use crate::flow::Protocol;
use crate::protect::SocketProtector;
use mio::event::Source;
use mio::net::{TcpStream, UdpSocket};
use socket2::{Domain, Socket, Type};
use std::io::{self, Write};
use std::net::{SocketAddr, SocketAddrV4};
use tracing::trace;

/// Options applied to every real TCP socket.
#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    pub keepalive: bool,
    pub nodelay: bool,
    pub recv_buffer: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            keepalive: true,
            nodelay: true,
            recv_buffer: 65535,
        }
    }
}

pub enum Channel {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Channel {
    pub fn protocol(&self) -> Protocol {
        match self {
            Channel::Tcp(_) => Protocol::Tcp,
            Channel::Udp(_) => Protocol::Udp,
        }
    }

    pub fn source(&mut self) -> &mut dyn Source {
        match self {
            Channel::Tcp(s) => s,
            Channel::Udp(s) => s,
        }
    }
}

/// Open a non-blocking TCP socket and start connecting it to `remote`.
///
/// The connect completes asynchronously; the caller waits for writability.
pub fn open_tcp(remote: SocketAddrV4, opts: &SocketOptions, protector: &SocketProtector) -> Result<TcpStream> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(socket2::Protocol::TCP))?;
    protector.protect_socket2(&socket)?;
    socket.set_nonblocking(true)?;
    socket.set_keepalive(opts.keepalive)?;
    socket.set_nodelay(opts.nodelay)?;
    socket.set_recv_buffer_size(opts.recv_buffer)?;

    match socket.connect(&SocketAddr::V4(remote).into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e.into()),
    }
    trace!("TCP connect to {} in progress", remote);

    Ok(TcpStream::from_std(std::net::TcpStream::from(socket)))
}

/// Open a non-blocking UDP socket connected to `remote`.
pub fn open_udp(remote: SocketAddrV4, protector: &SocketProtector) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(socket2::Protocol::UDP))?;
    protector.protect_socket2(&socket)?;
    socket.set_nonblocking(true)?;
    socket.connect(&SocketAddr::V4(remote).into())?;

    Ok(UdpSocket::from_std(std::net::UdpSocket::from(socket)))
}

/// Result of polling an in-progress connect.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectProgress {
    Connected,
    Pending,
}

/// Check whether a connect reported by a writable event actually finished.
pub fn finish_connect(stream: &TcpStream) -> Result<ConnectProgress> {
    if let Some(e) = stream.take_error()? {
        return Err(e.into());
    }
    match stream.peer_addr() {
        Ok(_) => Ok(ConnectProgress::Connected),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(ConnectProgress::Pending),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(ConnectProgress::Pending),
        Err(e) => Err(e.into()),
    }
}

/// Write as much of `buf` as the socket accepts.
///
/// Gives up after `retry_limit` consecutive `WouldBlock`s and returns what
/// was written so far, which may be zero. Only real socket errors fail.
pub fn write_available(stream: &mut TcpStream, mut buf: &[u8], retry_limit: usize) -> Result<usize> {
    let mut written = 0;
    let mut spins = 0;
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => {
                written += n;
                buf = &buf[n..];
                spins = 0;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                spins += 1;
                if spins > retry_limit {
                    trace!("Socket send buffer full, {} bytes left unwritten", buf.len());
                    break;
                }
                std::thread::yield_now();
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::io::Read;
    use std::net::{Ipv4Addr, TcpListener};
    use std::time::{Duration, Instant};

    fn loopback(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    #[test]
    fn test_tcp_connect_and_write() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut stream = open_tcp(loopback(port), &SocketOptions::default(), &SocketProtector::none()).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while finish_connect(&stream).unwrap() == ConnectProgress::Pending {
            assert!(Instant::now() < deadline, "connect never completed");
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(write_available(&mut stream, b"hello", 16).unwrap(), 5);
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_full_send_buffer_returns_partial_count() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut stream = open_tcp(loopback(port), &SocketOptions::default(), &SocketProtector::none()).unwrap();
        // Accepted but never read from
        let (_server, _) = listener.accept().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while finish_connect(&stream).unwrap() == ConnectProgress::Pending {
            assert!(Instant::now() < deadline, "connect never completed");
            std::thread::sleep(Duration::from_millis(5));
        }

        let chunk = vec![0x5au8; 64 * 1024];
        let mut accepted = 0;
        loop {
            let n = write_available(&mut stream, &chunk, 8).unwrap();
            assert!(n <= chunk.len());
            accepted += n;
            if n < chunk.len() {
                break;
            }
            assert!(accepted < 256 * 1024 * 1024, "send buffer never filled");
        }
        assert!(accepted > 0);
    }

    #[test]
    fn test_refused_connect_reports_error() {
        // Bind then drop to get a port nothing listens on
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let stream = open_tcp(loopback(port), &SocketOptions::default(), &SocketProtector::none());

        let stream = match stream {
            Ok(s) => s,
            Err(_) => return,
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match finish_connect(&stream) {
                Err(_) => break,
                Ok(ConnectProgress::Pending) => {
                    assert!(Instant::now() < deadline, "refused connect never surfaced");
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(ConnectProgress::Connected) => panic!("connected to a closed port"),
            }
        }
    }

    #[test]
    fn test_protect_failure_aborts_open() {
        let protector = SocketProtector::new(|_| false);
        assert!(matches!(
            open_udp(loopback(9), &protector),
            Err(EngineError::ProtectFailed(_))
        ));
    }
}
