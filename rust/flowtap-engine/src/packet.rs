//! IPv4 packet parsing and building using smoltcp wire types

use crate::error::{EngineError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use smoltcp::wire::{IpProtocol, Ipv4Packet, TcpPacket, UdpPacket};
use std::net::{Ipv4Addr, SocketAddrV4};

pub const DEFAULT_MTU: usize = 1500;
pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

/// TTL stamped on packets synthesised for a live flow.
pub const ENGINE_TTL: u8 = 64;
/// TTL stamped on resets answering segments of unknown flows.
pub const STRAY_RST_TTL: u8 = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
}

impl TcpFlags {
    pub fn syn_ack() -> Self {
        Self { syn: true, ack: true, ..Default::default() }
    }
    pub fn ack_only() -> Self {
        Self { ack: true, ..Default::default() }
    }
    pub fn fin_only() -> Self {
        Self { fin: true, ..Default::default() }
    }
    pub fn fin_ack() -> Self {
        Self { fin: true, ack: true, ..Default::default() }
    }
    pub fn rst_only() -> Self {
        Self { rst: true, ..Default::default() }
    }
    pub fn psh_ack() -> Self {
        Self { psh: true, ack: true, ..Default::default() }
    }

    pub fn to_byte(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        flags
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            fin: byte & 0x01 != 0,
            syn: byte & 0x02 != 0,
            rst: byte & 0x04 != 0,
            psh: byte & 0x08 != 0,
            ack: byte & 0x10 != 0,
        }
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (self.syn, "SYN"),
            (self.ack, "ACK"),
            (self.psh, "PSH"),
            (self.fin, "FIN"),
            (self.rst, "RST"),
        ];
        let set: Vec<&str> = names.iter().filter(|(on, _)| *on).map(|(_, n)| *n).collect();
        if set.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}", set.join("|"))
        }
    }
}

/// IPv4 header fields the engine echoes back or needs for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub tos: u8,
    pub ident: u16,
    pub ttl: u8,
    pub total_len: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportInfo {
    Tcp(TcpInfo),
    Udp(UdpInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpInfo {
    pub src_port: u16,
    pub dst_port: u16,
}

/// A decoded IPv4 packet holding on to its raw bytes.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    data: Bytes,
    pub ip: Ipv4Header,
    pub transport: TransportInfo,
    payload_offset: usize,
    payload_len: usize,
}

impl ParsedPacket {
    pub fn protocol(&self) -> IpProtocol {
        match self.transport {
            TransportInfo::Tcp(_) => IpProtocol::Tcp,
            TransportInfo::Udp(_) => IpProtocol::Udp,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.payload_offset..self.payload_offset + self.payload_len]
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Length of the whole packet as it was read from the tunnel.
    pub fn wire_len(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn src_socket(&self) -> SocketAddrV4 {
        match self.transport {
            TransportInfo::Tcp(t) => SocketAddrV4::new(self.ip.src, t.src_port),
            TransportInfo::Udp(u) => SocketAddrV4::new(self.ip.src, u.src_port),
        }
    }

    pub fn dst_socket(&self) -> SocketAddrV4 {
        match self.transport {
            TransportInfo::Tcp(t) => SocketAddrV4::new(self.ip.dst, t.dst_port),
            TransportInfo::Udp(u) => SocketAddrV4::new(self.ip.dst, u.dst_port),
        }
    }

    pub fn tcp(&self) -> Option<&TcpInfo> {
        match &self.transport {
            TransportInfo::Tcp(t) => Some(t),
            _ => None,
        }
    }

    pub fn udp(&self) -> Option<&UdpInfo> {
        match &self.transport {
            TransportInfo::Udp(u) => Some(u),
            _ => None,
        }
    }
}

/// Read the version nibble without validating anything else.
pub fn ip_version(data: &[u8]) -> Option<u8> {
    data.first().map(|b| b >> 4)
}

/// Read the IPv4 total-length field without validating anything else.
pub fn declared_total_len(data: &[u8]) -> Option<u16> {
    if data.len() < 4 {
        return None;
    }
    Some(u16::from_be_bytes([data[2], data[3]]))
}

/// Parse an IPv4 TCP or UDP packet
pub fn parse_packet(data: Bytes) -> Result<ParsedPacket> {
    if data.is_empty() {
        return Err(EngineError::PacketTooShort { expected: IPV4_HEADER_LEN, actual: 0 });
    }

    let version = data[0] >> 4;
    if version != 4 {
        return Err(EngineError::InvalidIpVersion(version));
    }

    let pkt = Ipv4Packet::new_checked(&data[..])
        .map_err(|e| EngineError::InvalidPacket(format!("IPv4: {}", e)))?;

    let header_len = pkt.header_len() as usize;
    let ip = Ipv4Header {
        src: pkt.src_addr(),
        dst: pkt.dst_addr(),
        tos: data[1],
        ident: pkt.ident(),
        ttl: pkt.hop_limit(),
        total_len: pkt.total_len(),
    };
    let protocol = pkt.next_header();
    let segment = pkt.payload();

    let (transport, transport_header_len, payload_len) = match protocol {
        IpProtocol::Tcp => parse_tcp(segment)?,
        IpProtocol::Udp => parse_udp(segment)?,
        other => return Err(EngineError::Unsupported(format!("IP protocol {}", other))),
    };

    Ok(ParsedPacket {
        ip,
        transport,
        payload_offset: header_len + transport_header_len,
        payload_len,
        data,
    })
}

fn parse_tcp(data: &[u8]) -> Result<(TransportInfo, usize, usize)> {
    let pkt = TcpPacket::new_checked(data)
        .map_err(|e| EngineError::InvalidPacket(format!("TCP: {}", e)))?;

    let header_len = pkt.header_len() as usize;
    let mut mss = None;

    if header_len > TCP_HEADER_LEN {
        let opts = &data[TCP_HEADER_LEN..header_len];
        let mut i = 0;
        while i < opts.len() {
            match opts[i] {
                0 => break,
                1 => i += 1,
                2 if i + 4 <= opts.len() => {
                    mss = Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]]));
                    i += 4;
                }
                _ => {
                    if i + 1 < opts.len() && opts[i + 1] > 0 {
                        i += opts[i + 1] as usize;
                    } else {
                        break;
                    }
                }
            }
        }
    }

    let info = TcpInfo {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        seq: pkt.seq_number().0 as u32,
        ack: pkt.ack_number().0 as u32,
        flags: TcpFlags {
            fin: pkt.fin(),
            syn: pkt.syn(),
            rst: pkt.rst(),
            psh: pkt.psh(),
            ack: pkt.ack(),
        },
        window: pkt.window_len(),
        mss,
    };

    Ok((TransportInfo::Tcp(info), header_len, data.len().saturating_sub(header_len)))
}

fn parse_udp(data: &[u8]) -> Result<(TransportInfo, usize, usize)> {
    let pkt = UdpPacket::new_checked(data)
        .map_err(|e| EngineError::InvalidPacket(format!("UDP: {}", e)))?;

    let info = UdpInfo {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
    };

    Ok((TransportInfo::Udp(info), UDP_HEADER_LEN, pkt.payload().len()))
}

/// Fields of a TCP segment to synthesise.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub tos: u8,
    pub ident: u16,
    pub ttl: u8,
    /// Only emitted on SYN segments.
    pub mss: Option<u16>,
    pub payload: &'a [u8],
}

/// Fields of a UDP datagram to synthesise.
#[derive(Debug, Clone, Copy)]
pub struct UdpDatagram<'a> {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub tos: u8,
    pub ident: u16,
    pub ttl: u8,
    pub payload: &'a [u8],
}

#[allow(clippy::too_many_arguments)]
fn put_ipv4_header(
    pkt: &mut BytesMut,
    total_len: usize,
    tos: u8,
    ident: u16,
    ttl: u8,
    protocol: u8,
    src: Ipv4Addr,
    dst: Ipv4Addr,
) {
    pkt.put_u8(0x45);
    pkt.put_u8(tos);
    pkt.put_u16(total_len as u16);
    pkt.put_u16(ident);
    pkt.put_u16(0x4000); // DF
    pkt.put_u8(ttl);
    pkt.put_u8(protocol);
    pkt.put_u16(0);
    pkt.put_slice(&src.octets());
    pkt.put_slice(&dst.octets());

    let ip_cksum = checksum(&pkt[..IPV4_HEADER_LEN]);
    pkt[10..12].copy_from_slice(&ip_cksum.to_be_bytes());
}

/// Build IPv4 TCP packet
pub fn build_ipv4_tcp(seg: &TcpSegment<'_>) -> Bytes {
    let tcp_opts_len = if seg.flags.syn && seg.mss.is_some() { 4 } else { 0 };
    let tcp_hdr_len = TCP_HEADER_LEN + tcp_opts_len;
    let total_len = IPV4_HEADER_LEN + tcp_hdr_len + seg.payload.len();

    let mut pkt = BytesMut::with_capacity(total_len);
    put_ipv4_header(&mut pkt, total_len, seg.tos, seg.ident, seg.ttl, 6, *seg.src.ip(), *seg.dst.ip());

    let tcp_start = IPV4_HEADER_LEN;
    pkt.put_u16(seg.src.port());
    pkt.put_u16(seg.dst.port());
    pkt.put_u32(seg.seq);
    pkt.put_u32(seg.ack);
    pkt.put_u8(((tcp_hdr_len / 4) as u8) << 4);
    pkt.put_u8(seg.flags.to_byte());
    pkt.put_u16(seg.window);
    pkt.put_u16(0); // checksum
    pkt.put_u16(0); // urgent pointer

    if tcp_opts_len > 0 {
        if let Some(mss) = seg.mss {
            pkt.put_u8(2);
            pkt.put_u8(4);
            pkt.put_u16(mss);
        }
    }
    pkt.put_slice(seg.payload);

    let tcp_cksum = transport_checksum(&seg.src.ip().octets(), &seg.dst.ip().octets(), 6, &pkt[tcp_start..]);
    pkt[tcp_start + 16..tcp_start + 18].copy_from_slice(&tcp_cksum.to_be_bytes());

    pkt.freeze()
}

/// Build IPv4 UDP packet
pub fn build_ipv4_udp(dgram: &UdpDatagram<'_>) -> Bytes {
    let udp_len = UDP_HEADER_LEN + dgram.payload.len();
    let total_len = IPV4_HEADER_LEN + udp_len;

    let mut pkt = BytesMut::with_capacity(total_len);
    put_ipv4_header(&mut pkt, total_len, dgram.tos, dgram.ident, dgram.ttl, 17, *dgram.src.ip(), *dgram.dst.ip());

    pkt.put_u16(dgram.src.port());
    pkt.put_u16(dgram.dst.port());
    pkt.put_u16(udp_len as u16);
    pkt.put_u16(0);
    pkt.put_slice(dgram.payload);

    let mut udp_cksum = transport_checksum(&dgram.src.ip().octets(), &dgram.dst.ip().octets(), 17, &pkt[IPV4_HEADER_LEN..]);
    if udp_cksum == 0 {
        udp_cksum = 0xFFFF;
    }
    pkt[IPV4_HEADER_LEN + 6..IPV4_HEADER_LEN + 8].copy_from_slice(&udp_cksum.to_be_bytes());

    pkt.freeze()
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

fn sum_words(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            ((chunk[0] as u32) << 8) | (chunk[1] as u32)
        } else {
            (chunk[0] as u32) << 8
        };
        sum = sum.wrapping_add(word);
    }
    sum
}

fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(data))
}

fn transport_checksum(src: &[u8; 4], dst: &[u8; 4], proto: u8, data: &[u8]) -> u16 {
    let mut sum = sum_words(src);
    sum = sum.wrapping_add(sum_words(dst));
    sum = sum.wrapping_add(proto as u32);
    sum = sum.wrapping_add(data.len() as u32);
    sum = sum.wrapping_add(sum_words(data));
    fold(sum)
}
