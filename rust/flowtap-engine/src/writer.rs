//! Serialised writes to the tunnel

use crate::error::{EngineError, Result};
use crate::stats::EngineStats;
use crate::tun::TunDevice;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, trace, warn};

#[derive(Debug)]
pub enum WriterMessage {
    Packet(Bytes),
    Shutdown,
}

/// Handle the dispatcher and the event loop queue synthesised packets on.
#[derive(Clone, Debug)]
pub struct TunnelSink {
    tx: mpsc::Sender<WriterMessage>,
}

impl TunnelSink {
    pub fn new(tx: mpsc::Sender<WriterMessage>) -> Self {
        Self { tx }
    }

    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<WriterMessage>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self::new(tx), rx)
    }

    /// Queue one packet, blocking while the writer is backed up.
    pub fn send(&self, packet: Bytes) -> Result<()> {
        self.tx
            .blocking_send(WriterMessage::Packet(packet))
            .map_err(|_| EngineError::ChannelClosed)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.tx
            .blocking_send(WriterMessage::Shutdown)
            .map_err(|_| EngineError::ChannelClosed)
    }
}

/// Tunnel writer thread body.
///
/// A failed write drops that one packet; the tunnel stays open.
pub fn run_writer(device: Arc<TunDevice>, mut rx: mpsc::Receiver<WriterMessage>, stats: Arc<EngineStats>) {
    info!("Tunnel writer started");
    while let Some(message) = rx.blocking_recv() {
        let packet = match message {
            WriterMessage::Packet(packet) => packet,
            WriterMessage::Shutdown => break,
        };
        match device.write_packet(&packet) {
            Ok(n) if n == packet.len() => {
                trace!("Wrote {} bytes to tunnel", n);
                stats.record_written(n);
            }
            Ok(n) => {
                warn!("Short tunnel write: {} of {} bytes", n, packet.len());
                stats.record_write_error();
            }
            Err(e) => {
                warn!("Tunnel write failed, dropping {} bytes: {}", packet.len(), e);
                stats.record_write_error();
            }
        }
    }
    info!("Tunnel writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tun::tests::tun_pair;

    #[test]
    fn test_writer_preserves_order_and_stops() {
        let (tun, client) = tun_pair();
        let stats = Arc::new(EngineStats::new());
        let (sink, rx) = TunnelSink::channel(16);

        let thread_stats = stats.clone();
        let handle = std::thread::spawn(move || run_writer(Arc::new(tun), rx, thread_stats));

        let producer = sink.clone();
        std::thread::spawn(move || {
            producer.send(Bytes::from_static(b"one")).unwrap();
            producer.send(Bytes::from_static(b"two")).unwrap();
            producer.shutdown().unwrap();
        })
        .join()
        .unwrap();
        handle.join().unwrap();

        let mut buf = [0u8; 16];
        let n = client.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"one");
        let n = client.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"two");
        assert_eq!(stats.snapshot().packets_written, 2);
        assert_eq!(stats.snapshot().bytes_written, 6);
    }

    #[test]
    fn test_write_failure_is_not_fatal() {
        let (tun, client) = tun_pair();
        drop(client);
        let stats = Arc::new(EngineStats::new());
        let (sink, rx) = TunnelSink::channel(4);

        let thread_stats = stats.clone();
        let handle = std::thread::spawn(move || run_writer(Arc::new(tun), rx, thread_stats));
        std::thread::spawn(move || {
            sink.send(Bytes::from_static(b"lost")).unwrap();
            sink.send(Bytes::from_static(b"lost too")).unwrap();
        })
        .join()
        .unwrap();
        handle.join().unwrap();

        assert_eq!(stats.snapshot().write_errors, 2);
    }

    #[test]
    fn test_send_after_writer_exit_fails() {
        let (sink, rx) = TunnelSink::channel(1);
        drop(rx);
        assert!(matches!(
            sink.send(Bytes::from_static(b"x")),
            Err(EngineError::ChannelClosed)
        ));
    }
}
