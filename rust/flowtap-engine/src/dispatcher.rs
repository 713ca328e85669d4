//! Dispatcher thread: client-side state machine of every flow
//!
//! The dispatcher is the only consumer of packets read from the tunnel, so
//! client-triggered transitions of a flow are totally ordered. It opens real
//! sockets, forwards client payload to them and answers the client with the
//! acknowledgements and resets a TCP peer would send.

use crate::channel::{self, write_available, Channel};
use crate::context::EngineContext;
use crate::error::{EngineError, Result};
use crate::flow::{build_stray_rst, Flow, FlowKey, FlowStatus};
use crate::packet::{ParsedPacket, TcpInfo, TransportInfo};
use crate::reader::DispatcherMessage;
use mio::Interest;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

pub struct Dispatcher {
    ctx: Arc<EngineContext>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub fn run(self, mut rx: mpsc::Receiver<DispatcherMessage>) {
        info!("Dispatcher started");
        while let Some(message) = rx.blocking_recv() {
            match message {
                DispatcherMessage::Packet(packet) => self.dispatch(&packet),
                DispatcherMessage::Shutdown => break,
            }
        }
        info!("Dispatcher stopped");
    }

    pub fn dispatch(&self, packet: &ParsedPacket) {
        self.ctx.stats.record_dispatched();
        match packet.transport {
            TransportInfo::Tcp(tcp) => self.on_tcp(packet, &tcp),
            TransportInfo::Udp(_) => self.on_udp(packet),
        }
    }

    fn on_tcp(&self, packet: &ParsedPacket, tcp: &TcpInfo) {
        let key = FlowKey::from_packet(packet);
        let flow = self.ctx.registry.find(&key);
        let flags = tcp.flags;

        if flags.rst {
            if let Some(flow) = flow {
                self.record_outbound(&flow, packet);
                self.ctx.abort_quietly(&flow, "reset by client");
            }
            return;
        }

        if flags.ack {
            let Some(flow) = flow else {
                self.stray_reset(packet);
                return;
            };
            self.record_outbound(&flow, packet);

            if flags.syn {
                self.ctx.abort(&flow, "SYN-ACK from client");
                return;
            }
            if packet.payload_len() > 0 {
                if let Err(e) = self.forward(&flow, packet, tcp) {
                    self.ctx.abort(&flow, &format!("forwarding failed: {}", e));
                    return;
                }
            }
            if flags.fin {
                self.on_fin(&flow, tcp);
            } else if packet.payload_len() == 0 {
                self.on_ack(&flow, tcp);
            }
            return;
        }

        if flags.syn {
            match flow {
                Some(existing) => debug!(
                    "[{}] {} duplicate SYN ignored ({})",
                    existing.id(),
                    key,
                    existing.status()
                ),
                None => self.open_tcp(packet),
            }
            return;
        }

        match flow {
            Some(flow) if flags.fin => {
                self.record_outbound(&flow, packet);
                self.on_fin(&flow, tcp);
            }
            Some(flow) => trace!("[{}] {} segment without ACK ignored", flow.id(), key),
            None => self.stray_reset(packet),
        }
    }

    fn stray_reset(&self, packet: &ParsedPacket) {
        if let Some(rst) = build_stray_rst(packet) {
            trace!("Stray segment {} -> {}, answering with RST", packet.src_socket(), packet.dst_socket());
            self.ctx.send(rst);
            self.ctx.stats.record_stray_reset();
        }
    }

    fn record_outbound(&self, flow: &Arc<Flow>, packet: &ParsedPacket) {
        if flow.is_dns() {
            return;
        }
        flow.stats().record_out(packet.wire_len(), packet.payload_len());
        self.ctx.cache.stage(flow);
    }

    /// Register a flow in the registry, tearing down whatever it replaces.
    fn admit(&self, flow: &Arc<Flow>) {
        if let Some(old) = self.ctx.registry.insert(flow.clone()) {
            self.ctx.stats.record_collision();
            self.ctx.abort_quietly(&old, "superseded by a new flow on the same key");
        }
    }

    fn open_tcp(&self, packet: &ParsedPacket) {
        let flow = Arc::new(Flow::from_packet(packet, self.ctx.config.session_id, self.ctx.config.mtu));
        let Some(tcp) = flow.tcp() else {
            return;
        };
        // The SYN occupies one sequence number
        tcp.state().advance_client_seq(1);

        self.admit(&flow);
        self.ctx.stats.record_tcp_flow();
        self.ctx.track(&flow);
        self.record_outbound(&flow, packet);

        if let Err(e) = self.connect(&flow) {
            self.ctx.abort(&flow, &format!("connect failed: {}", e));
        }
    }

    fn connect(&self, flow: &Arc<Flow>) -> Result<()> {
        flow.transition(FlowStatus::Connecting)?;
        let stream = channel::open_tcp(flow.remote(), &self.ctx.config.socket_options(), &self.ctx.protector)?;
        *flow.channel() = Some(Channel::Tcp(stream));
        self.ctx.selector.lock().register(flow, Interest::WRITABLE)?;
        debug!("[{}] {} connecting", flow.id(), flow.key());
        Ok(())
    }

    fn forward(&self, flow: &Arc<Flow>, packet: &ParsedPacket, info: &TcpInfo) -> Result<()> {
        let tcp = flow.tcp().ok_or(EngineError::ChannelMismatch)?;
        let state = tcp.state();

        match flow.status() {
            FlowStatus::Connecting if state.syn_ack_sent() => self.complete_handshake(flow)?,
            FlowStatus::Connected | FlowStatus::Closing => {}
            other => {
                return Err(EngineError::Internal(format!("payload while {}", other)));
            }
        }

        // Retransmissions and out-of-order segments are only re-acknowledged
        if info.seq != state.client_seq() {
            trace!(
                "[{}] {} segment at {} while expecting {}",
                flow.id(),
                flow.key(),
                info.seq,
                state.client_seq()
            );
            self.ctx.send_to_client(flow, tcp.build_empty_ack(), 0);
            return Ok(());
        }

        let payload = packet.payload();
        let written = {
            let mut out = flow.out_buffer();
            let capacity = self.ctx.config.mtu;
            if payload.len() > capacity {
                return Err(EngineError::BufferOverflow {
                    len: payload.len(),
                    capacity,
                });
            }
            out.clear();
            out.extend_from_slice(payload);

            let mut channel = flow.channel();
            match channel.as_mut() {
                Some(Channel::Tcp(stream)) => write_available(stream, &out, self.ctx.config.write_retry_limit)?,
                Some(Channel::Udp(_)) => return Err(EngineError::ChannelMismatch),
                None => return Err(EngineError::NoChannel),
            }
        };

        // Only what the socket took is acknowledged; the client resends the rest
        state.advance_client_seq(written as u32);
        if written < payload.len() {
            debug!(
                "[{}] {} remote is slow, took {} of {} bytes",
                flow.id(),
                flow.key(),
                written,
                payload.len()
            );
        } else {
            trace!("[{}] {} forwarded {} bytes", flow.id(), flow.key(), written);
        }
        self.ctx.send_to_client(flow, tcp.build_empty_ack(), 0);
        Ok(())
    }

    fn on_fin(&self, flow: &Arc<Flow>, info: &TcpInfo) {
        let Some(tcp) = flow.tcp() else {
            return;
        };
        let state = tcp.state();

        match flow.status() {
            FlowStatus::New => self.ctx.abort(flow, "FIN during handshake"),
            FlowStatus::Connecting if !state.syn_ack_sent() => {
                self.ctx.abort(flow, "FIN during handshake");
            }
            FlowStatus::Connecting | FlowStatus::Connected => {
                {
                    let mut selector = self.ctx.selector.lock();
                    if let Err(e) = flow.transition(FlowStatus::Closing) {
                        drop(selector);
                        self.ctx.abort(flow, &e.to_string());
                        return;
                    }
                    selector.close(flow);
                }
                state.advance_client_seq(1);
                state.mark_client_fin();
                self.ctx.send_to_client(flow, tcp.build_fin_ack(), 0);
            }
            FlowStatus::Closing => {
                if !state.client_fin_seen() {
                    state.advance_client_seq(1);
                    state.mark_client_fin();
                }
                self.ctx.send_to_client(flow, tcp.build_empty_ack(), 0);
                if state.teardown_complete(info.ack) {
                    self.finish(flow);
                }
            }
            FlowStatus::Closed => {
                self.ctx.abort(flow, "FIN on closed flow");
            }
            FlowStatus::Aborted => {}
        }
    }

    fn on_ack(&self, flow: &Arc<Flow>, info: &TcpInfo) {
        let Some(tcp) = flow.tcp() else {
            return;
        };
        match flow.status() {
            FlowStatus::Connecting if tcp.state().syn_ack_sent() => {
                if let Err(e) = self.complete_handshake(flow) {
                    self.ctx.abort(flow, &e.to_string());
                }
            }
            FlowStatus::Closing if tcp.state().teardown_complete(info.ack) => self.finish(flow),
            FlowStatus::Closed => self.ctx.abort(flow, "ACK on closed flow"),
            status => trace!("[{}] {} bare ACK while {}", flow.id(), flow.key(), status),
        }
    }

    /// The client acknowledged the SYN-ACK.
    fn complete_handshake(&self, flow: &Arc<Flow>) -> Result<()> {
        match flow.transition(FlowStatus::Connected) {
            Ok(_) => Ok(()),
            // The remote hung up first and the event loop already half-closed
            Err(_) if flow.status() == FlowStatus::Closing => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn finish(&self, flow: &Arc<Flow>) {
        if let Err(e) = self.ctx.close(flow) {
            self.ctx.abort(flow, &e.to_string());
        }
    }

    fn on_udp(&self, packet: &ParsedPacket) {
        let key = FlowKey::from_packet(packet);
        let flow = match self.ctx.registry.find(&key) {
            Some(flow) => flow,
            None => {
                let flow = Arc::new(Flow::from_packet(packet, self.ctx.config.session_id, self.ctx.config.mtu));
                self.admit(&flow);
                self.ctx.stats.record_udp_flow();
                self.ctx.track(&flow);
                flow
            }
        };
        self.record_outbound(&flow, packet);

        let reusable = matches!(flow.status(), FlowStatus::Connecting | FlowStatus::Connected) && flow.has_channel();
        if !reusable {
            if let Err(e) = self.open_udp(&flow) {
                warn!("[{}] {} could not open channel: {}", flow.id(), key, e);
                self.ctx.discard(&flow);
                return;
            }
        }

        if let Err(e) = self.send_datagram(&flow, packet.payload()) {
            debug!("[{}] {} send failed: {}", flow.id(), key, e);
            self.ctx.discard(&flow);
        }
    }

    fn open_udp(&self, flow: &Arc<Flow>) -> Result<()> {
        if flow.status() == FlowStatus::New {
            flow.transition(FlowStatus::Connecting)?;
        }
        let socket = channel::open_udp(flow.remote(), &self.ctx.protector)?;
        *flow.channel() = Some(Channel::Udp(socket));
        self.ctx.selector.lock().register(flow, Interest::READABLE)?;
        flow.transition(FlowStatus::Connected)?;
        Ok(())
    }

    fn send_datagram(&self, flow: &Arc<Flow>, payload: &[u8]) -> Result<()> {
        let mut channel = flow.channel();
        let socket = match channel.as_mut() {
            Some(Channel::Udp(socket)) => socket,
            Some(Channel::Tcp(_)) => return Err(EngineError::ChannelMismatch),
            None => return Err(EngineError::NoChannel),
        };
        match socket.send(payload) {
            Ok(_) => {
                if let Some(udp) = flow.udp() {
                    udp.state().touch();
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("[{}] {} datagram dropped, socket busy", flow.id(), flow.key());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::Harness;
    use crate::flow::tests::{client_addr, remote_addr, syn, tcp_flow, tcp_packet, udp_packet};
    use crate::packet::{parse_packet, TcpFlags};
    use crate::protect::SocketProtector;
    use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, UdpSocket};

    fn listener() -> (TcpListener, SocketAddrV4) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    fn flow_for(harness: &Harness, packet: &ParsedPacket) -> Option<Arc<Flow>> {
        harness.ctx.registry.find(&FlowKey::from_packet(packet))
    }

    #[test]
    fn test_stray_segment_gets_rst() {
        let mut harness = Harness::new();
        let dispatcher = Dispatcher::new(harness.ctx.clone());
        let (_listener, remote) = listener();

        let stray = tcp_packet(client_addr(), remote, 5555, 7777, TcpFlags::ack_only(), b"late data");
        dispatcher.dispatch(&stray);

        let written = harness.written();
        assert_eq!(written.len(), 1);
        let rst = parse_packet(written[0].clone()).unwrap();
        let info = rst.tcp().unwrap();
        assert!(info.flags.rst);
        assert_eq!(info.seq, 7777);
        assert_eq!(info.ack, 5555);
        assert_eq!(harness.ctx.stats.snapshot().stray_resets, 1);
        assert!(harness.ctx.registry.is_empty());
    }

    #[test]
    fn test_syn_opens_connecting_flow() {
        let mut harness = Harness::new();
        let dispatcher = Dispatcher::new(harness.ctx.clone());
        let (_listener, remote) = listener();

        let packet = syn(client_addr(), remote, 1000);
        dispatcher.dispatch(&packet);

        let flow = flow_for(&harness, &packet).unwrap();
        assert_eq!(flow.status(), FlowStatus::Connecting);
        assert!(flow.has_channel());
        assert!(flow.token().is_some());
        assert_eq!(flow.tcp().unwrap().state().client_seq(), 1001);
        assert_eq!(flow.id(), 1);
        assert_eq!(harness.store.len(), 1);
        assert!(harness.written().is_empty());

        // A retransmitted SYN changes nothing
        dispatcher.dispatch(&packet);
        assert!(Arc::ptr_eq(&flow, &flow_for(&harness, &packet).unwrap()));
        assert_eq!(harness.ctx.registry.len(), 1);
        assert_eq!(harness.ctx.stats.snapshot().tcp_flows, 1);
    }

    #[test]
    fn test_client_syn_ack_aborts() {
        let mut harness = Harness::new();
        let dispatcher = Dispatcher::new(harness.ctx.clone());
        let (_listener, remote) = listener();

        dispatcher.dispatch(&syn(client_addr(), remote, 1000));
        let flow = harness.ctx.registry.flows().pop().unwrap();
        dispatcher.dispatch(&tcp_packet(client_addr(), remote, 1001, 1, TcpFlags::syn_ack(), &[]));

        let written = harness.written();
        assert_eq!(written.len(), 1);
        assert!(parse_packet(written[0].clone()).unwrap().tcp().unwrap().flags.rst);
        assert_eq!(flow.status(), FlowStatus::Aborted);
        assert!(!flow.has_channel());
        assert!(harness.ctx.registry.is_empty());
        assert!(harness.ctx.selector.is_empty());
    }

    #[test]
    fn test_fin_during_handshake_aborts() {
        let mut harness = Harness::new();
        let dispatcher = Dispatcher::new(harness.ctx.clone());
        let (_listener, remote) = listener();

        dispatcher.dispatch(&syn(client_addr(), remote, 1000));
        dispatcher.dispatch(&tcp_packet(client_addr(), remote, 1001, 0, TcpFlags::fin_only(), &[]));

        let written = harness.written();
        assert_eq!(written.len(), 1);
        assert!(parse_packet(written[0].clone()).unwrap().tcp().unwrap().flags.rst);
        assert!(harness.ctx.registry.is_empty());
    }

    #[test]
    fn test_client_rst_aborts_quietly() {
        let mut harness = Harness::new();
        let dispatcher = Dispatcher::new(harness.ctx.clone());
        let (_listener, remote) = listener();

        dispatcher.dispatch(&syn(client_addr(), remote, 1000));
        let flow = harness.ctx.registry.flows().pop().unwrap();
        dispatcher.dispatch(&tcp_packet(client_addr(), remote, 1001, 0, TcpFlags::rst_only(), &[]));

        assert!(harness.written().is_empty());
        assert_eq!(flow.status(), FlowStatus::Aborted);
        assert!(harness.ctx.registry.is_empty());

        // A reset for a flow that no longer exists is ignored
        dispatcher.dispatch(&tcp_packet(client_addr(), remote, 1001, 0, TcpFlags::rst_only(), &[]));
        assert!(harness.written().is_empty());
    }

    #[test]
    fn test_unprotectable_socket_aborts_flow() {
        let mut harness = Harness::with_protector(SocketProtector::new(|_| false));
        let dispatcher = Dispatcher::new(harness.ctx.clone());
        let (_listener, remote) = listener();

        dispatcher.dispatch(&syn(client_addr(), remote, 1000));

        let written = harness.written();
        assert_eq!(written.len(), 1);
        let rst = parse_packet(written[0].clone()).unwrap();
        assert!(rst.tcp().unwrap().flags.rst);
        assert_eq!(rst.tcp().unwrap().ack, 1001);
        assert!(harness.ctx.registry.is_empty());
        assert_eq!(harness.ctx.stats.snapshot().flows_aborted, 1);

        // Datagram flows are dropped without a reply
        dispatcher.dispatch(&udp_packet(client_addr(), remote, b"ping"));
        assert!(harness.written().is_empty());
        assert!(harness.ctx.registry.is_empty());
    }

    #[test]
    fn test_udp_channel_reuse_and_reopen() {
        let harness = Harness::new();
        let dispatcher = Dispatcher::new(harness.ctx.clone());
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let remote = SocketAddrV4::new(Ipv4Addr::LOCALHOST, server.local_addr().unwrap().port());

        let first = udp_packet(client_addr(), remote, b"one");
        dispatcher.dispatch(&first);
        let flow = flow_for(&harness, &first).unwrap();
        assert_eq!(flow.status(), FlowStatus::Connected);
        let token = flow.token().unwrap();

        dispatcher.dispatch(&udp_packet(client_addr(), remote, b"two"));
        assert_eq!(flow.token(), Some(token));

        let mut buf = [0u8; 16];
        let (n, from_one) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"one");
        let (n, from_two) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"two");
        assert_eq!(from_one, from_two);

        // A flow that lost its channel gets a fresh one
        harness.ctx.selector.lock().close(&flow);
        dispatcher.dispatch(&udp_packet(client_addr(), remote, b"three"));
        assert!(Arc::ptr_eq(&flow, &flow_for(&harness, &first).unwrap()));
        assert!(flow.has_channel());
        assert_ne!(flow.token(), Some(token));
        assert_eq!(flow.status(), FlowStatus::Connected);
        let (n, from_three) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"three");
        assert_ne!(from_three, from_one);

        assert_eq!(harness.ctx.stats.snapshot().udp_flows, 1);
        assert_eq!(flow.stats().snapshot().packets_out, 3);
    }

    #[test]
    fn test_dns_flows_are_not_persisted() {
        let harness = Harness::new();
        let dispatcher = Dispatcher::new(harness.ctx.clone());

        let query = udp_packet(client_addr(), SocketAddrV4::new(Ipv4Addr::LOCALHOST, 53), b"\x12\x34");
        dispatcher.dispatch(&query);

        let flow = flow_for(&harness, &query).expect("DNS flow registered");
        assert!(flow.is_dns());
        assert_eq!(flow.status(), FlowStatus::Connected);
        assert_eq!(flow.id(), 0);
        assert_eq!(flow.stats().snapshot().packets_out, 0);
        assert!(harness.store.is_empty());
    }

    #[test]
    fn test_oversized_segment_aborts() {
        let mut harness = Harness::new();
        let dispatcher = Dispatcher::new(harness.ctx.clone());
        let (_listener, remote) = listener();

        let opening = syn(client_addr(), remote, 1000);
        dispatcher.dispatch(&opening);
        let flow = flow_for(&harness, &opening).unwrap();
        let tcp = flow.tcp().unwrap();
        tcp.build_syn_ack();
        let engine_next = tcp.state().engine_seq();

        let payload = vec![0x41u8; harness.ctx.config.mtu + 100];
        dispatcher.dispatch(&tcp_packet(client_addr(), remote, 1001, engine_next, TcpFlags::psh_ack(), &payload));

        let written = harness.written();
        assert_eq!(written.len(), 1);
        assert!(parse_packet(written[0].clone()).unwrap().tcp().unwrap().flags.rst);
        assert_eq!(flow.status(), FlowStatus::Aborted);
        assert!(!flow.has_channel());
        assert!(harness.ctx.registry.is_empty());
    }

    #[test]
    fn test_segments_on_closed_flow_abort() {
        for flags in [TcpFlags::fin_ack(), TcpFlags::ack_only()] {
            let mut harness = Harness::new();
            let dispatcher = Dispatcher::new(harness.ctx.clone());

            let flow = Arc::new(tcp_flow());
            for to in [
                FlowStatus::Connecting,
                FlowStatus::Connected,
                FlowStatus::Closing,
                FlowStatus::Closed,
            ] {
                flow.transition(to).unwrap();
            }
            harness.ctx.registry.insert(flow.clone());

            dispatcher.dispatch(&tcp_packet(client_addr(), remote_addr(), 1001, 1, flags, &[]));

            let written = harness.written();
            assert_eq!(written.len(), 1);
            assert!(parse_packet(written[0].clone()).unwrap().tcp().unwrap().flags.rst);
            assert_eq!(flow.status(), FlowStatus::Aborted);
            assert!(harness.ctx.registry.is_empty());
        }
    }
}
