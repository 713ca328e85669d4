//! TCP half of the flow: sequence tracking and segment synthesis

use super::{Flow, FlowStatus, Protocol, ProtocolState, HEADER_OVERHEAD};
use crate::packet::{
    build_ipv4_tcp, ParsedPacket, TcpFlags, TcpInfo, TcpSegment, DEFAULT_MTU, ENGINE_TTL, STRAY_RST_TTL,
};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Sequence state of the client-facing half of a relayed TCP connection.
///
/// Both counters are absolute 32-bit sequence numbers and wrap.
pub struct TcpState {
    client_initial: u32,
    engine_initial: u32,
    client_seq: AtomicU32,
    engine_seq: AtomicU32,
    window: u16,
    mss: Option<u16>,
    link_mss: u16,
    syn_ack_sent: AtomicBool,
    client_fin: AtomicBool,
    engine_fin: AtomicBool,
}

impl TcpState {
    pub(super) fn new(syn: &TcpInfo, mtu: usize) -> Self {
        let mut state = Self::with_engine_isn(syn, rand::random());
        state.link_mss = max_segment_payload(mtu).min(u16::MAX as usize) as u16;
        state
    }

    pub(super) fn with_engine_isn(syn: &TcpInfo, engine_isn: u32) -> Self {
        Self {
            client_initial: syn.seq,
            engine_initial: engine_isn,
            client_seq: AtomicU32::new(syn.seq),
            engine_seq: AtomicU32::new(engine_isn),
            window: syn.window,
            mss: syn.mss,
            link_mss: max_segment_payload(DEFAULT_MTU) as u16,
            syn_ack_sent: AtomicBool::new(false),
            client_fin: AtomicBool::new(false),
            engine_fin: AtomicBool::new(false),
        }
    }

    pub fn client_initial(&self) -> u32 {
        self.client_initial
    }

    pub fn engine_initial(&self) -> u32 {
        self.engine_initial
    }

    pub fn client_seq(&self) -> u32 {
        self.client_seq.load(Ordering::Acquire)
    }

    pub fn engine_seq(&self) -> u32 {
        self.engine_seq.load(Ordering::Acquire)
    }

    pub fn window(&self) -> u16 {
        self.window
    }

    pub fn mss(&self) -> Option<u16> {
        self.mss
    }

    /// Advance the client-observed sequence number, returning the new value.
    pub fn advance_client_seq(&self, n: u32) -> u32 {
        self.client_seq.fetch_add(n, Ordering::AcqRel).wrapping_add(n)
    }

    /// Reserve `n` sequence numbers on the engine side, returning the first.
    pub fn take_engine_seq(&self, n: u32) -> u32 {
        self.engine_seq.fetch_add(n, Ordering::AcqRel)
    }

    /// Offset from the client's initial sequence number, for logging.
    pub fn relative_client_seq(&self) -> i64 {
        self.client_seq().wrapping_sub(self.client_initial) as i64
    }

    /// Offset from the engine's initial sequence number, for logging.
    pub fn relative_engine_seq(&self) -> i64 {
        self.engine_seq().wrapping_sub(self.engine_initial) as i64
    }

    /// The real connect finished and the client has been answered.
    pub fn syn_ack_sent(&self) -> bool {
        self.syn_ack_sent.load(Ordering::Acquire)
    }

    pub fn client_fin_seen(&self) -> bool {
        self.client_fin.load(Ordering::Acquire)
    }

    pub fn engine_fin_sent(&self) -> bool {
        self.engine_fin.load(Ordering::Acquire)
    }

    pub(crate) fn mark_client_fin(&self) {
        self.client_fin.store(true, Ordering::Release);
    }

    /// Both FINs exchanged and the client has acknowledged ours.
    pub fn teardown_complete(&self, client_ack: u32) -> bool {
        self.client_fin_seen() && self.engine_fin_sent() && client_ack == self.engine_seq()
    }
}

impl ProtocolState for TcpState {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn permits(&self, from: FlowStatus, to: FlowStatus) -> bool {
        use FlowStatus::*;
        match (from, to) {
            (_, Aborted) => from != Aborted,
            (New, Connecting) | (Connecting, Connected) | (Connected, Closing) | (Closing, Closed) => true,
            // Either side may start closing before the client's handshake ACK arrives
            (Connecting, Closing) => self.syn_ack_sent(),
            _ => false,
        }
    }

    fn describe(&self) -> String {
        format!(
            "seq={} ack={}",
            self.relative_engine_seq(),
            self.relative_client_seq()
        )
    }
}

/// A TCP flow together with its sequence state.
///
/// Every builder stamps the current engine sequence number as `seq` and the
/// last client sequence number as `ack`, then advances the engine side by
/// what the segment occupies in sequence space.
#[derive(Clone, Copy)]
pub struct TcpView<'a> {
    flow: &'a Flow,
    state: &'a TcpState,
}

impl<'a> TcpView<'a> {
    pub(super) fn new(flow: &'a Flow, state: &'a TcpState) -> Self {
        Self { flow, state }
    }

    pub fn state(&self) -> &'a TcpState {
        self.state
    }

    fn segment(&self, seq: u32, flags: TcpFlags, mss: Option<u16>, payload: &[u8]) -> Bytes {
        build_ipv4_tcp(&TcpSegment {
            src: self.flow.remote(),
            dst: self.flow.local(),
            seq,
            ack: self.state.client_seq(),
            flags,
            window: self.state.window,
            tos: self.flow.tos(),
            ident: self.flow.ident(),
            ttl: ENGINE_TTL,
            mss,
            payload,
        })
    }

    pub fn build_syn_ack(&self) -> Bytes {
        let link_mss = self.state.link_mss;
        let mss = Some(self.state.mss.map_or(link_mss, |m| m.min(link_mss)));
        let seq = self.state.take_engine_seq(1);
        self.state.syn_ack_sent.store(true, Ordering::Release);
        self.segment(seq, TcpFlags::syn_ack(), mss, &[])
    }

    pub fn build_empty_ack(&self) -> Bytes {
        self.segment(self.state.engine_seq(), TcpFlags::ack_only(), None, &[])
    }

    pub fn build_data_ack(&self, payload: &[u8]) -> Bytes {
        let seq = self.state.take_engine_seq(payload.len() as u32);
        self.segment(seq, TcpFlags::psh_ack(), None, payload)
    }

    pub fn build_rst(&self) -> Bytes {
        let flags = TcpFlags { rst: true, ack: true, ..Default::default() };
        self.segment(self.state.engine_seq(), flags, None, &[])
    }

    pub fn build_fin(&self) -> Bytes {
        let seq = self.state.take_engine_seq(1);
        self.state.engine_fin.store(true, Ordering::Release);
        self.segment(seq, TcpFlags::fin_only(), None, &[])
    }

    pub fn build_fin_ack(&self) -> Bytes {
        let seq = self.state.take_engine_seq(1);
        self.state.engine_fin.store(true, Ordering::Release);
        self.segment(seq, TcpFlags::fin_ack(), None, &[])
    }
}

/// Reset for a segment that belongs to no known flow, built from the
/// segment alone.
pub fn build_stray_rst(packet: &ParsedPacket) -> Option<Bytes> {
    let tcp = packet.tcp()?;
    Some(build_ipv4_tcp(&TcpSegment {
        src: packet.dst_socket(),
        dst: packet.src_socket(),
        seq: tcp.ack,
        ack: tcp.seq,
        flags: TcpFlags::rst_only(),
        window: tcp.window,
        tos: packet.ip.tos,
        ident: packet.ip.ident,
        ttl: STRAY_RST_TTL,
        mss: None,
        payload: &[],
    }))
}

/// Largest payload a synthesised segment may carry for a given MTU.
pub fn max_segment_payload(mtu: usize) -> usize {
    mtu.saturating_sub(HEADER_OVERHEAD)
}
