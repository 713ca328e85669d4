//! Per-connection state shared by the dispatcher and the event loop
//!
//! A [`Flow`] is created by the dispatcher for the first packet of a
//! connection and then touched from two threads: the dispatcher drives
//! client-triggered transitions, the event loop drives server-triggered
//! ones. Every field that crosses that boundary sits behind an atomic or a
//! lock.
//!
//! Protocol specifics live in [`TcpState`] and [`UdpState`], which implement
//! [`ProtocolState`] so that the transition table and log formatting are
//! chosen per variant.

mod tcp;
mod udp;

pub use tcp::{build_stray_rst, max_segment_payload, TcpState, TcpView};
pub use udp::{UdpState, UdpView};

use crate::channel::Channel;
use crate::error::{EngineError, Result};
use crate::packet::{ParsedPacket, TransportInfo};
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use mio::Token;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

pub const DNS_PORT: u16 = 53;
pub const TLS_PORT: u16 = 443;

/// Room taken by the IPv4 and TCP headers in front of a payload.
pub const HEADER_OVERHEAD: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

impl From<Protocol> for flowtap_sock2proc::Transport {
    fn from(p: Protocol) -> Self {
        match p {
            Protocol::Tcp => flowtap_sock2proc::Transport::Tcp,
            Protocol::Udp => flowtap_sock2proc::Transport::Udp,
        }
    }
}

/// Identity of a flow in the registry.
///
/// The local address is left out on purpose: every packet read from the
/// tunnel carries the same local (tunnel) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub remote_addr: Ipv4Addr,
    pub local_port: u16,
    pub remote_port: u16,
}

impl FlowKey {
    /// Key of the flow an outbound (client to remote) packet belongs to.
    pub fn from_packet(packet: &ParsedPacket) -> Self {
        let (protocol, local_port, remote_port) = match packet.transport {
            TransportInfo::Tcp(t) => (Protocol::Tcp, t.src_port, t.dst_port),
            TransportInfo::Udp(u) => (Protocol::Udp, u.src_port, u.dst_port),
        };
        Self {
            protocol,
            remote_addr: packet.ip.dst,
            local_port,
            remote_port,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} :{} -> {}:{}",
            self.protocol, self.local_port, self.remote_addr, self.remote_port
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlowStatus {
    New,
    Connecting,
    Connected,
    Closing,
    Closed,
    Aborted,
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowStatus::Closed | FlowStatus::Aborted)
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowStatus::New => "NEW",
            FlowStatus::Connecting => "CONNECTING",
            FlowStatus::Connected => "CONNECTED",
            FlowStatus::Closing => "CLOSING",
            FlowStatus::Closed => "CLOSED",
            FlowStatus::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// Behaviour that differs between the TCP and UDP variants.
pub trait ProtocolState: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Whether `from -> to` is a legal status change for this variant.
    fn permits(&self, from: FlowStatus, to: FlowStatus) -> bool;

    /// Short protocol-specific state for log lines.
    fn describe(&self) -> String;
}

pub enum FlowKind {
    Tcp(TcpState),
    Udp(UdpState),
}

impl FlowKind {
    pub fn state(&self) -> &dyn ProtocolState {
        match self {
            FlowKind::Tcp(s) => s,
            FlowKind::Udp(s) => s,
        }
    }
}

/// Traffic counters. "In" is remote to client, "out" is client to remote.
#[derive(Debug, Default)]
pub struct FlowStats {
    pub total_bytes_in: AtomicU64,
    pub total_bytes_out: AtomicU64,
    pub payload_bytes_in: AtomicU64,
    pub payload_bytes_out: AtomicU64,
    pub packets_in: AtomicU64,
    pub packets_out: AtomicU64,
}

impl FlowStats {
    pub fn record_out(&self, total: usize, payload: usize) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        self.total_bytes_out.fetch_add(total as u64, Ordering::Relaxed);
        self.payload_bytes_out.fetch_add(payload as u64, Ordering::Relaxed);
    }

    pub fn record_in(&self, total: usize, payload: usize) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.total_bytes_in.fetch_add(total as u64, Ordering::Relaxed);
        self.payload_bytes_in.fetch_add(payload as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FlowStatsSnapshot {
        FlowStatsSnapshot {
            total_bytes_in: self.total_bytes_in.load(Ordering::Relaxed),
            total_bytes_out: self.total_bytes_out.load(Ordering::Relaxed),
            payload_bytes_in: self.payload_bytes_in.load(Ordering::Relaxed),
            payload_bytes_out: self.payload_bytes_out.load(Ordering::Relaxed),
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowStatsSnapshot {
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub payload_bytes_in: u64,
    pub payload_bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
}

/// Who opened the flow and where it goes, filled in after the fact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attribution {
    pub app_package: Option<String>,
    pub app_label: Option<String>,
    pub uid: Option<u32>,
    pub hostname: Option<String>,
    pub pay_level_domain: Option<String>,
}

struct StatusCell {
    status: FlowStatus,
    ended_at: Option<DateTime<Utc>>,
}

pub struct Flow {
    key: FlowKey,
    local: SocketAddrV4,
    remote: SocketAddrV4,
    session_id: u64,
    created_at: DateTime<Utc>,
    tos: u8,
    ident: u16,
    id: AtomicU64,
    status: Mutex<StatusCell>,
    kind: FlowKind,
    channel: Mutex<Option<Channel>>,
    token: Mutex<Option<Token>>,
    out_buffer: Mutex<BytesMut>,
    in_buffer: Mutex<Box<[u8]>>,
    stats: FlowStats,
    attribution: RwLock<Attribution>,
}

impl Flow {
    /// Build a flow from its opening packet (a TCP SYN or a first datagram).
    pub fn from_packet(packet: &ParsedPacket, session_id: u64, mtu: usize) -> Self {
        let kind = match packet.transport {
            TransportInfo::Tcp(t) => FlowKind::Tcp(TcpState::new(&t, mtu)),
            TransportInfo::Udp(u) => FlowKind::Udp(UdpState::new(u.dst_port == DNS_PORT)),
        };

        Self {
            key: FlowKey::from_packet(packet),
            local: packet.src_socket(),
            remote: packet.dst_socket(),
            session_id,
            created_at: Utc::now(),
            tos: packet.ip.tos,
            ident: packet.ip.ident,
            id: AtomicU64::new(0),
            status: Mutex::new(StatusCell {
                status: FlowStatus::New,
                ended_at: None,
            }),
            kind,
            channel: Mutex::new(None),
            token: Mutex::new(None),
            out_buffer: Mutex::new(BytesMut::with_capacity(mtu)),
            in_buffer: Mutex::new(vec![0u8; mtu.saturating_sub(HEADER_OVERHEAD)].into_boxed_slice()),
            stats: FlowStats::default(),
            attribution: RwLock::new(Attribution::default()),
        }
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    pub fn protocol(&self) -> Protocol {
        self.key.protocol
    }

    pub fn local(&self) -> SocketAddrV4 {
        self.local
    }

    pub fn remote(&self) -> SocketAddrV4 {
        self.remote
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn tos(&self) -> u8 {
        self.tos
    }

    pub(crate) fn ident(&self) -> u16 {
        self.ident
    }

    /// Store id, 0 until the flow has been persisted.
    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    pub fn set_id(&self, id: u64) {
        self.id.store(id, Ordering::Release);
    }

    pub fn kind(&self) -> &FlowKind {
        &self.kind
    }

    pub fn tcp(&self) -> Option<TcpView<'_>> {
        match &self.kind {
            FlowKind::Tcp(state) => Some(TcpView::new(self, state)),
            FlowKind::Udp(_) => None,
        }
    }

    pub fn udp(&self) -> Option<UdpView<'_>> {
        match &self.kind {
            FlowKind::Udp(state) => Some(UdpView::new(self, state)),
            FlowKind::Tcp(_) => None,
        }
    }

    /// Name-resolution flows are short-lived and never billed to an app.
    pub fn is_dns(&self) -> bool {
        matches!(&self.kind, FlowKind::Udp(s) if s.is_dns())
    }

    pub fn is_tls(&self) -> bool {
        self.remote.port() == TLS_PORT
    }

    pub fn status(&self) -> FlowStatus {
        self.status.lock().status
    }

    /// Wall-clock end of the flow, set on the first terminal transition.
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.status.lock().ended_at
    }

    /// Move to `to`, returning the previous status.
    ///
    /// Requesting the current status is a no-op. Anything the variant's
    /// transition table does not allow is rejected and leaves the flow
    /// untouched.
    pub fn transition(&self, to: FlowStatus) -> Result<FlowStatus> {
        let mut cell = self.status.lock();
        let from = cell.status;
        if from == to {
            return Ok(from);
        }
        let state = self.kind.state();
        if !state.permits(from, to) {
            return Err(EngineError::IllegalTransition { from, to });
        }
        cell.status = to;
        if to.is_terminal() && cell.ended_at.is_none() {
            cell.ended_at = Some(Utc::now());
        }
        debug!("[{}] {} {} -> {} ({})", self.id(), self.key, from, to, state.describe());
        Ok(from)
    }

    /// Session teardown: close whatever is still open, bypassing the
    /// transition table.
    pub fn force_close(&self) {
        let mut cell = self.status.lock();
        if cell.status.is_terminal() {
            return;
        }
        debug!("[{}] {} {} -> {} (teardown)", self.id(), self.key, cell.status, FlowStatus::Closed);
        cell.status = FlowStatus::Closed;
        cell.ended_at = Some(Utc::now());
    }

    pub fn channel(&self) -> MutexGuard<'_, Option<Channel>> {
        self.channel.lock()
    }

    pub fn has_channel(&self) -> bool {
        self.channel.lock().is_some()
    }

    pub fn token(&self) -> Option<Token> {
        *self.token.lock()
    }

    pub(crate) fn set_token(&self, token: Option<Token>) {
        *self.token.lock() = token;
    }

    pub(crate) fn out_buffer(&self) -> MutexGuard<'_, BytesMut> {
        self.out_buffer.lock()
    }

    pub(crate) fn in_buffer(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.in_buffer.lock()
    }

    pub fn stats(&self) -> &FlowStats {
        &self.stats
    }

    pub fn attribution(&self) -> Attribution {
        self.attribution.read().clone()
    }

    pub fn set_attribution(&self, attribution: Attribution) {
        *self.attribution.write() = attribution;
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.id())
            .field("key", &self.key)
            .field("status", &self.status())
            .field("state", &self.kind.state().describe())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::packet::{build_ipv4_tcp, build_ipv4_udp, parse_packet, TcpFlags, TcpSegment, UdpDatagram};
    use proptest::prelude::*;

    pub fn client_addr() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 2, 15), 54321)
    }

    pub fn remote_addr() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80)
    }

    pub fn tcp_packet(src: SocketAddrV4, dst: SocketAddrV4, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> ParsedPacket {
        let bytes = build_ipv4_tcp(&TcpSegment {
            src,
            dst,
            seq,
            ack,
            flags,
            window: 29200,
            tos: 0,
            ident: 0x4242,
            ttl: 64,
            mss: if flags.syn { Some(1400) } else { None },
            payload,
        });
        parse_packet(bytes).unwrap()
    }

    pub fn syn(src: SocketAddrV4, dst: SocketAddrV4, seq: u32) -> ParsedPacket {
        let flags = TcpFlags { syn: true, ..Default::default() };
        tcp_packet(src, dst, seq, 0, flags, &[])
    }

    pub fn udp_packet(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> ParsedPacket {
        let bytes = build_ipv4_udp(&UdpDatagram {
            src,
            dst,
            tos: 0,
            ident: 9,
            ttl: 64,
            payload,
        });
        parse_packet(bytes).unwrap()
    }

    pub fn tcp_flow() -> Flow {
        Flow::from_packet(&syn(client_addr(), remote_addr(), 1000), 1, 1500)
    }

    #[test]
    fn test_key_from_packet_matches_flow() {
        let packet = syn(client_addr(), remote_addr(), 1000);
        let flow = Flow::from_packet(&packet, 1, 1500);
        assert_eq!(FlowKey::from_packet(&packet), flow.key());
        assert_eq!(flow.key().local_port, 54321);
        assert_eq!(flow.key().remote_addr, Ipv4Addr::new(93, 184, 216, 34));
        assert_eq!(flow.local(), client_addr());
        assert_eq!(flow.remote(), remote_addr());
    }

    #[test]
    fn test_keys_differ_on_any_port() {
        // Ports that collide modulo 256 must still produce distinct keys
        let a = FlowKey::from_packet(&syn(SocketAddrV4::new(*client_addr().ip(), 0x1234), remote_addr(), 1));
        let b = FlowKey::from_packet(&syn(SocketAddrV4::new(*client_addr().ip(), 0x5534), remote_addr(), 1));
        assert_ne!(a, b);

        let tcp = FlowKey::from_packet(&syn(client_addr(), remote_addr(), 1));
        let udp = FlowKey::from_packet(&udp_packet(client_addr(), remote_addr(), b"x"));
        assert_ne!(tcp, udp);
    }

    #[test]
    fn test_tcp_happy_path_transitions() {
        let flow = tcp_flow();
        assert_eq!(flow.status(), FlowStatus::New);
        for to in [
            FlowStatus::Connecting,
            FlowStatus::Connected,
            FlowStatus::Closing,
            FlowStatus::Closed,
        ] {
            flow.transition(to).unwrap();
        }
        assert!(flow.ended_at().is_some());
    }

    #[test]
    fn test_tcp_rejects_skips() {
        let flow = tcp_flow();
        assert!(matches!(
            flow.transition(FlowStatus::Connected),
            Err(EngineError::IllegalTransition { from: FlowStatus::New, to: FlowStatus::Connected })
        ));
        flow.transition(FlowStatus::Connecting).unwrap();
        assert!(flow.transition(FlowStatus::Closing).is_err());
        assert_eq!(flow.status(), FlowStatus::Connecting);
    }

    #[test]
    fn test_abort_from_any_state() {
        let flow = tcp_flow();
        flow.transition(FlowStatus::Connecting).unwrap();
        flow.transition(FlowStatus::Aborted).unwrap();
        assert!(flow.transition(FlowStatus::Connected).is_err());

        let closed = tcp_flow();
        closed.force_close();
        assert_eq!(closed.status(), FlowStatus::Closed);
        closed.transition(FlowStatus::Aborted).unwrap();
    }

    #[test]
    fn test_udp_closes_from_any_live_state() {
        let flow = Flow::from_packet(&udp_packet(client_addr(), SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53), b"q"), 1, 1500);
        assert!(flow.is_dns());
        assert!(flow.tcp().is_none());
        flow.transition(FlowStatus::Connecting).unwrap();
        flow.transition(FlowStatus::Closed).unwrap();
        assert!(flow.transition(FlowStatus::Closing).is_err());
    }

    #[test]
    fn test_force_close_keeps_terminal() {
        let flow = tcp_flow();
        flow.transition(FlowStatus::Aborted).unwrap();
        flow.force_close();
        assert_eq!(flow.status(), FlowStatus::Aborted);
    }

    #[test]
    fn test_tls_flag_follows_port() {
        let https = Flow::from_packet(&syn(client_addr(), SocketAddrV4::new(*remote_addr().ip(), 443), 1), 1, 1500);
        assert!(https.is_tls());
        assert!(!tcp_flow().is_tls());
    }

    #[test]
    fn test_buffers_sized_from_mtu() {
        let flow = tcp_flow();
        assert_eq!(flow.in_buffer().len(), 1460);
        assert!(flow.out_buffer().capacity() >= 1500);
    }

    fn status_strategy() -> impl Strategy<Value = FlowStatus> {
        prop_oneof![
            Just(FlowStatus::New),
            Just(FlowStatus::Connecting),
            Just(FlowStatus::Connected),
            Just(FlowStatus::Closing),
            Just(FlowStatus::Closed),
            Just(FlowStatus::Aborted),
        ]
    }

    proptest! {
        #[test]
        fn prop_key_agrees_with_flow(
            a in any::<[u8; 4]>(),
            local_port in 1u16..,
            remote_port in 1u16..,
            seq in any::<u32>(),
        ) {
            let remote = SocketAddrV4::new(Ipv4Addr::from(a), remote_port);
            let local = SocketAddrV4::new(*client_addr().ip(), local_port);
            let packet = syn(local, remote, seq);
            let flow = Flow::from_packet(&packet, 7, 1500);
            prop_assert_eq!(FlowKey::from_packet(&packet), flow.key());

            let later = tcp_packet(local, remote, seq.wrapping_add(1), 5, TcpFlags::ack_only(), b"data");
            prop_assert_eq!(FlowKey::from_packet(&later), flow.key());
        }

        #[test]
        fn prop_tcp_transitions_are_monotonic(requests in prop::collection::vec(status_strategy(), 0..24)) {
            let flow = tcp_flow();
            for to in requests {
                let before = flow.status();
                if flow.transition(to).is_ok() && before != to {
                    let legal = to == FlowStatus::Aborted
                        || matches!(
                            (before, to),
                            (FlowStatus::New, FlowStatus::Connecting)
                                | (FlowStatus::Connecting, FlowStatus::Connected)
                                | (FlowStatus::Connected, FlowStatus::Closing)
                                | (FlowStatus::Closing, FlowStatus::Closed)
                        );
                    prop_assert!(legal, "{} -> {}", before, to);
                }
            }
        }
    }
}
