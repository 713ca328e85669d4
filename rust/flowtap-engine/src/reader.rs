//! Tunnel reader thread
//!
//! Waits on the tunnel and the interrupt pipe, reads one datagram per
//! wake-up and hands every parsable IPv4 packet to the dispatcher.

use crate::error::{EngineError, Result};
use crate::packet::{declared_total_len, ip_version, parse_packet, ParsedPacket};
use crate::stats::EngineStats;
use crate::tun::{Interrupter, TunDevice};
use bytes::Bytes;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug)]
pub enum DispatcherMessage {
    Packet(ParsedPacket),
    Shutdown,
}

pub struct TunnelReader {
    device: Arc<TunDevice>,
    interrupter: Arc<Interrupter>,
    dispatcher: mpsc::Sender<DispatcherMessage>,
    stats: Arc<EngineStats>,
    buf: Vec<u8>,
}

impl TunnelReader {
    pub fn new(
        device: Arc<TunDevice>,
        interrupter: Arc<Interrupter>,
        dispatcher: mpsc::Sender<DispatcherMessage>,
        stats: Arc<EngineStats>,
        mtu: usize,
    ) -> Self {
        Self {
            device,
            interrupter,
            dispatcher,
            stats,
            buf: vec![0u8; mtu],
        }
    }

    pub fn run(mut self) -> Result<()> {
        info!("Tunnel reader started on fd {}", self.device.fd());
        let result = self.read_loop();
        match &result {
            Ok(()) => info!("Tunnel reader stopped"),
            Err(e) => error!("Tunnel reader failed: {}", e),
        }
        result
    }

    fn read_loop(&mut self) -> Result<()> {
        loop {
            let mut fds = [
                libc::pollfd {
                    fd: self.device.fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.interrupter.fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }

            if fds[1].revents & (libc::POLLHUP | libc::POLLERR | libc::POLLIN) != 0 {
                debug!("Tunnel reader interrupted");
                return Ok(());
            }

            let tun_events = fds[0].revents;
            if tun_events & libc::POLLIN != 0 {
                let n = match self.device.read_packet(&mut self.buf) {
                    Ok(n) => n,
                    Err(EngineError::Io(e))
                        if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) =>
                    {
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                self.stats.record_read();
                let Some(packet) = decode(&self.buf[..n], &self.stats) else {
                    continue;
                };
                if self.dispatcher.blocking_send(DispatcherMessage::Packet(packet)).is_err() {
                    return Err(EngineError::ChannelClosed);
                }
            } else if tun_events & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
                return Err(EngineError::Internal(format!(
                    "tunnel descriptor reported poll events {:#x}",
                    tun_events
                )));
            }
        }
    }
}

/// Turn one datagram read from the tunnel into a packet for the dispatcher,
/// or drop it.
pub(crate) fn decode(data: &[u8], stats: &EngineStats) -> Option<ParsedPacket> {
    match ip_version(data) {
        Some(4) => {}
        Some(6) => {
            trace!("Dropping IPv6 packet of {} bytes", data.len());
            stats.record_dropped();
            return None;
        }
        other => {
            debug!("Dropping packet with IP version {:?}", other);
            stats.record_invalid();
            return None;
        }
    }

    if let Some(declared) = declared_total_len(data) {
        if declared as usize != data.len() {
            warn!("IPv4 total length {} but read {} bytes", declared, data.len());
        }
    }

    // Copy out only what was read; the read buffer is reused
    let packet = match parse_packet(Bytes::copy_from_slice(data)) {
        Ok(packet) => packet,
        Err(EngineError::Unsupported(what)) => {
            trace!("Dropping unsupported packet: {}", what);
            stats.record_dropped();
            return None;
        }
        Err(e) => {
            debug!("Dropping malformed packet: {}", e);
            stats.record_invalid();
            return None;
        }
    };

    if packet.ip.dst == Ipv4Addr::BROADCAST {
        trace!("Dropping broadcast packet from {}", packet.ip.src);
        stats.record_dropped();
        return None;
    }

    Some(packet)
}
