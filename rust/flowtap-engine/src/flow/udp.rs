//! UDP half of the flow

use super::{Flow, FlowStatus, Protocol, ProtocolState};
use crate::packet::{build_ipv4_udp, UdpDatagram, ENGINE_TTL};
use bytes::Bytes;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

pub struct UdpState {
    dns: bool,
    last_activity: Mutex<Instant>,
}

impl UdpState {
    pub(super) fn new(dns: bool) -> Self {
        Self {
            dns,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn is_dns(&self) -> bool {
        self.dns
    }

    /// Note a datagram passing in either direction.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.idle_for() > timeout
    }
}

impl ProtocolState for UdpState {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    // No handshake and no half-close: a datagram flow ends from whatever
    // live state it is in.
    fn permits(&self, from: FlowStatus, to: FlowStatus) -> bool {
        use FlowStatus::*;
        match (from, to) {
            (_, Aborted) => from != Aborted,
            (New, Connecting) | (Connecting, Connected) => true,
            (New | Connecting | Connected, Closed) => true,
            _ => false,
        }
    }

    fn describe(&self) -> String {
        if self.dns { "dns".to_string() } else { "datagram".to_string() }
    }
}

#[derive(Clone, Copy)]
pub struct UdpView<'a> {
    flow: &'a Flow,
    state: &'a UdpState,
}

impl<'a> UdpView<'a> {
    pub(super) fn new(flow: &'a Flow, state: &'a UdpState) -> Self {
        Self { flow, state }
    }

    pub fn state(&self) -> &'a UdpState {
        self.state
    }

    /// Wrap a datagram received on the real channel for the tunnel.
    pub fn build_datagram(&self, payload: &[u8]) -> Bytes {
        build_ipv4_udp(&UdpDatagram {
            src: self.flow.remote(),
            dst: self.flow.local(),
            tos: self.flow.tos(),
            ident: self.flow.ident(),
            ttl: ENGINE_TTL,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::flow::tests::{client_addr, remote_addr, udp_packet};
    use crate::flow::{Flow, FlowStatus};
    use crate::packet::parse_packet;
    use std::time::Duration;

    #[test]
    fn test_datagram_addressed_back_to_client() {
        let flow = Flow::from_packet(&udp_packet(client_addr(), remote_addr(), b"ping"), 1, 1500);
        assert!(!flow.is_dns());
        let udp = flow.udp().unwrap();
        let packet = parse_packet(udp.build_datagram(b"pong")).unwrap();
        assert_eq!(packet.src_socket(), remote_addr());
        assert_eq!(packet.dst_socket(), client_addr());
        assert_eq!(packet.payload(), b"pong");
    }

    #[test]
    fn test_activity_resets_idle_clock() {
        let flow = Flow::from_packet(&udp_packet(client_addr(), remote_addr(), b"ping"), 1, 1500);
        let state = flow.udp().unwrap().state();
        std::thread::sleep(Duration::from_millis(30));
        assert!(state.is_timed_out(Duration::from_millis(10)));

        state.touch();
        assert!(!state.is_timed_out(Duration::from_secs(5)));
        assert!(state.idle_for() < Duration::from_secs(5));
    }

    #[test]
    fn test_udp_rejects_closing() {
        let flow = Flow::from_packet(&udp_packet(client_addr(), remote_addr(), b"ping"), 1, 1500);
        flow.transition(FlowStatus::Connecting).unwrap();
        flow.transition(FlowStatus::Connected).unwrap();
        assert!(flow.transition(FlowStatus::Closing).is_err());
        flow.transition(FlowStatus::Closed).unwrap();
    }
}
