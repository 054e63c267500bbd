//! IPv4/TCP/UDP header codec.
//!
//! Typed header structs with explicit big-endian decode/encode, plus the
//! response builders used to stamp device-bound segments. Serialization is
//! byte-for-byte symmetric with parsing, so a parse -> serialize round trip
//! on an unmodified header reproduces the original bytes.

use crate::error::{RelayError, Result};
use bytes::BytesMut;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};

pub const IP4_HEADER_SIZE: usize = 20;
pub const TCP_HEADER_SIZE: usize = 20;
pub const UDP_HEADER_SIZE: usize = 8;

/// Transport protocol carried by an IPv4 datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Other(u8),
}

impl Protocol {
    pub fn from_number(n: u8) -> Self {
        match n {
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            other => Protocol::Other(other),
        }
    }

    pub fn number(&self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Other(n) => *n,
        }
    }
}

/// TCP control flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
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

    pub fn from_byte(b: u8) -> Self {
        Self {
            fin: b & 0x01 != 0,
            syn: b & 0x02 != 0,
            rst: b & 0x04 != 0,
            psh: b & 0x08 != 0,
            ack: b & 0x10 != 0,
            urg: b & 0x20 != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        if self.urg { flags |= 0x20; }
        flags
    }
}

/// IPv4 header. Options are not supported: header length is fixed at 20
/// bytes, and the identification/flags/fragment-offset field is carried as
/// one opaque 32-bit value.
#[derive(Debug, Clone)]
pub struct Ipv4Header {
    pub version: u8,
    pub ihl: u8,
    pub type_of_service: u8,
    pub total_length: u16,
    pub ident_flags_fragment: u32,
    pub ttl: u8,
    pub protocol: Protocol,
    pub checksum: u16,
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
}

impl Ipv4Header {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < IP4_HEADER_SIZE {
            return Err(RelayError::Truncated { expected: IP4_HEADER_SIZE, actual: data.len() });
        }
        let version = data[0] >> 4;
        let ihl = data[0] & 0x0F;
        if version != 4 {
            return Err(RelayError::Malformed(format!("IP version {}", version)));
        }
        if ihl != 5 {
            return Err(RelayError::Malformed(format!("IP options not supported (IHL {})", ihl)));
        }
        let total_length = u16::from_be_bytes([data[2], data[3]]);
        if (total_length as usize) < IP4_HEADER_SIZE {
            return Err(RelayError::Malformed(format!("total length {}", total_length)));
        }
        Ok(Self {
            version,
            ihl,
            type_of_service: data[1],
            total_length,
            ident_flags_fragment: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ttl: data[8],
            protocol: Protocol::from_number(data[9]),
            checksum: u16::from_be_bytes([data[10], data[11]]),
            src_addr: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            dst_addr: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        })
    }

    pub fn encode(&self, out: &mut [u8]) {
        out[0] = (self.version << 4) | self.ihl;
        out[1] = self.type_of_service;
        out[2..4].copy_from_slice(&self.total_length.to_be_bytes());
        out[4..8].copy_from_slice(&self.ident_flags_fragment.to_be_bytes());
        out[8] = self.ttl;
        out[9] = self.protocol.number();
        out[10..12].copy_from_slice(&self.checksum.to_be_bytes());
        out[12..16].copy_from_slice(&self.src_addr.octets());
        out[16..20].copy_from_slice(&self.dst_addr.octets());
    }
}

/// TCP header. Trailing options bytes are captured verbatim and not
/// interpreted.
#[derive(Debug, Clone)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent_pointer: u16,
    pub options: Vec<u8>,
}

impl TcpHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < TCP_HEADER_SIZE {
            return Err(RelayError::Truncated { expected: TCP_HEADER_SIZE, actual: data.len() });
        }
        let header_len = ((data[12] >> 4) as usize) * 4;
        if header_len < TCP_HEADER_SIZE || header_len > data.len() {
            return Err(RelayError::Malformed(format!("TCP data offset {}", header_len)));
        }
        Ok(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags: TcpFlags::from_byte(data[13]),
            window: u16::from_be_bytes([data[14], data[15]]),
            checksum: u16::from_be_bytes([data[16], data[17]]),
            urgent_pointer: u16::from_be_bytes([data[18], data[19]]),
            options: data[TCP_HEADER_SIZE..header_len].to_vec(),
        })
    }

    /// Header length in bytes, options included.
    pub fn header_len(&self) -> usize {
        TCP_HEADER_SIZE + self.options.len()
    }

    pub fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq.to_be_bytes());
        out[8..12].copy_from_slice(&self.ack.to_be_bytes());
        out[12] = ((self.header_len() / 4) as u8) << 4;
        out[13] = self.flags.to_byte();
        out[14..16].copy_from_slice(&self.window.to_be_bytes());
        out[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        out[18..20].copy_from_slice(&self.urgent_pointer.to_be_bytes());
        out[TCP_HEADER_SIZE..self.header_len()].copy_from_slice(&self.options);
    }
}

#[derive(Debug, Clone)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < UDP_HEADER_SIZE {
            return Err(RelayError::Truncated { expected: UDP_HEADER_SIZE, actual: data.len() });
        }
        Ok(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            checksum: u16::from_be_bytes([data[6], data[7]]),
        })
    }

    pub fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..6].copy_from_slice(&self.length.to_be_bytes());
        out[6..8].copy_from_slice(&self.checksum.to_be_bytes());
    }
}

#[derive(Debug, Clone)]
pub enum TransportHeader {
    Tcp(TcpHeader),
    Udp(UdpHeader),
    Unknown(u8),
}

/// One parsed frame read from the virtual interface. Owns its backing
/// buffer; exactly one relay stage holds a `Packet` at a time.
#[derive(Debug)]
pub struct Packet {
    pub ipv4: Ipv4Header,
    pub transport: TransportHeader,
    buffer: BytesMut,
    payload_offset: usize,
}

impl Packet {
    pub fn parse(buffer: BytesMut) -> Result<Self> {
        let ipv4 = Ipv4Header::parse(&buffer)?;
        let rest = &buffer[IP4_HEADER_SIZE..];
        let (transport, transport_len) = match ipv4.protocol {
            Protocol::Tcp => {
                let tcp = TcpHeader::parse(rest)?;
                let len = tcp.header_len();
                (TransportHeader::Tcp(tcp), len)
            }
            Protocol::Udp => {
                let udp = UdpHeader::parse(rest)?;
                (TransportHeader::Udp(udp), UDP_HEADER_SIZE)
            }
            Protocol::Other(n) => (TransportHeader::Unknown(n), 0),
        };
        Ok(Self {
            ipv4,
            transport,
            payload_offset: IP4_HEADER_SIZE + transport_len,
            buffer,
        })
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self.transport, TransportHeader::Tcp(_))
    }

    pub fn is_udp(&self) -> bool {
        matches!(self.transport, TransportHeader::Udp(_))
    }

    pub fn tcp(&self) -> Option<&TcpHeader> {
        match &self.transport {
            TransportHeader::Tcp(h) => Some(h),
            _ => None,
        }
    }

    pub fn udp(&self) -> Option<&UdpHeader> {
        match &self.transport {
            TransportHeader::Udp(h) => Some(h),
            _ => None,
        }
    }

    pub fn src_socket(&self) -> Option<SocketAddr> {
        let port = match &self.transport {
            TransportHeader::Tcp(h) => h.src_port,
            TransportHeader::Udp(h) => h.src_port,
            TransportHeader::Unknown(_) => return None,
        };
        Some(SocketAddr::new(IpAddr::V4(self.ipv4.src_addr), port))
    }

    pub fn dst_socket(&self) -> Option<SocketAddr> {
        let port = match &self.transport {
            TransportHeader::Tcp(h) => h.dst_port,
            TransportHeader::Udp(h) => h.dst_port,
            TransportHeader::Unknown(_) => return None,
        };
        Some(SocketAddr::new(IpAddr::V4(self.ipv4.dst_addr), port))
    }

    /// Transport payload, bounded by the IP total length.
    pub fn payload(&self) -> &[u8] {
        let end = (self.ipv4.total_length as usize).min(self.buffer.len());
        if self.payload_offset < end {
            &self.buffer[self.payload_offset..end]
        } else {
            &[]
        }
    }

    /// Raw IPv4 header bytes as they arrived on the wire.
    pub fn ip_header_bytes(&self) -> &[u8] {
        &self.buffer[..IP4_HEADER_SIZE]
    }

    /// Raw transport header bytes (empty for unknown protocols).
    pub fn transport_header_bytes(&self) -> &[u8] {
        &self.buffer[IP4_HEADER_SIZE..self.payload_offset]
    }

    /// Re-encode the in-memory headers into `out`. Produces the same layout
    /// the parser consumes.
    pub fn serialize_headers(&self, out: &mut [u8]) {
        self.ipv4.encode(out);
        match &self.transport {
            TransportHeader::Tcp(h) => h.encode(&mut out[IP4_HEADER_SIZE..]),
            TransportHeader::Udp(h) => h.encode(&mut out[IP4_HEADER_SIZE..]),
            TransportHeader::Unknown(_) => {}
        }
    }

    /// Hand the backing buffer back, consuming the packet.
    pub fn into_buffer(self) -> BytesMut {
        self.buffer
    }
}

/// Ones'-complement sum over 16-bit words, folded and complemented.
fn fold_checksum(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

fn sum_words(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    for i in (0..data.len()).step_by(2) {
        let word = if i + 1 < data.len() {
            ((data[i] as u32) << 8) | (data[i + 1] as u32)
        } else {
            (data[i] as u32) << 8
        };
        sum = sum.wrapping_add(word);
    }
    sum
}

/// IPv4 header checksum over the 20-byte header. The checksum field must be
/// zeroed by the caller before computing.
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    fold_checksum(sum_words(header))
}

/// TCP checksum over the pseudo-header plus header+payload. The checksum
/// field in `segment` must be zeroed by the caller before computing.
pub fn tcp_checksum(src: &Ipv4Addr, dst: &Ipv4Addr, segment: &[u8]) -> u16 {
    let s = src.octets();
    let d = dst.octets();
    let mut sum = 0u32;
    sum = sum.wrapping_add(((s[0] as u32) << 8) | s[1] as u32);
    sum = sum.wrapping_add(((s[2] as u32) << 8) | s[3] as u32);
    sum = sum.wrapping_add(((d[0] as u32) << 8) | d[1] as u32);
    sum = sum.wrapping_add(((d[2] as u32) << 8) | d[3] as u32);
    sum = sum.wrapping_add(Protocol::Tcp.number() as u32);
    sum = sum.wrapping_add(segment.len() as u32);
    sum = sum.wrapping_add(sum_words(segment));
    fold_checksum(sum)
}

// IP identification for locally built datagrams.
static IP_ID: AtomicU16 = AtomicU16::new(1);

/// Addressing for device-bound frames on one flow, with source and
/// destination already swapped so the remote peer appears as the sender.
/// Response segments are built from immutable inputs into a freshly
/// serialized, checksum-complete buffer; nothing is patched in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseTemplate {
    pub src_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_addr: Ipv4Addr,
    pub dst_port: u16,
}

impl ResponseTemplate {
    pub fn new(src_addr: Ipv4Addr, src_port: u16, dst_addr: Ipv4Addr, dst_port: u16) -> Self {
        Self { src_addr, src_port, dst_addr, dst_port }
    }

    /// Template for answering `packet`: source and destination swapped.
    pub fn from_request(packet: &Packet) -> Option<Self> {
        let (src_port, dst_port) = match &packet.transport {
            TransportHeader::Tcp(h) => (h.dst_port, h.src_port),
            TransportHeader::Udp(h) => (h.dst_port, h.src_port),
            TransportHeader::Unknown(_) => return None,
        };
        Some(Self {
            src_addr: packet.ipv4.dst_addr,
            src_port,
            dst_addr: packet.ipv4.src_addr,
            dst_port,
        })
    }

    fn write_ipv4(&self, buf: &mut BytesMut, protocol: Protocol, total_len: usize) {
        let header = Ipv4Header {
            version: 4,
            ihl: 5,
            type_of_service: 0,
            total_length: total_len as u16,
            ident_flags_fragment: ((IP_ID.fetch_add(1, Ordering::Relaxed) as u32) << 16) | 0x4000,
            ttl: 64,
            protocol,
            checksum: 0,
            src_addr: self.src_addr,
            dst_addr: self.dst_addr,
        };
        header.encode(&mut buf[..IP4_HEADER_SIZE]);
        let cksum = ipv4_checksum(&buf[..IP4_HEADER_SIZE]);
        buf[10..12].copy_from_slice(&cksum.to_be_bytes());
    }

    /// Serialize a TCP segment for this flow into `buf` (cleared first).
    pub fn write_tcp_segment(
        &self,
        buf: &mut BytesMut,
        flags: TcpFlags,
        seq: u32,
        ack: u32,
        payload: &[u8],
    ) {
        let total_len = IP4_HEADER_SIZE + TCP_HEADER_SIZE + payload.len();
        buf.clear();
        buf.resize(total_len, 0);

        let tcp = TcpHeader {
            src_port: self.src_port,
            dst_port: self.dst_port,
            seq,
            ack,
            flags,
            window: 65535,
            checksum: 0,
            urgent_pointer: 0,
            options: Vec::new(),
        };
        tcp.encode(&mut buf[IP4_HEADER_SIZE..IP4_HEADER_SIZE + TCP_HEADER_SIZE]);
        buf[IP4_HEADER_SIZE + TCP_HEADER_SIZE..].copy_from_slice(payload);

        let cksum = tcp_checksum(&self.src_addr, &self.dst_addr, &buf[IP4_HEADER_SIZE..]);
        buf[IP4_HEADER_SIZE + 16..IP4_HEADER_SIZE + 18].copy_from_slice(&cksum.to_be_bytes());

        self.write_ipv4(buf, Protocol::Tcp, total_len);
    }

    pub fn tcp_segment(&self, flags: TcpFlags, seq: u32, ack: u32, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(IP4_HEADER_SIZE + TCP_HEADER_SIZE + payload.len());
        self.write_tcp_segment(&mut buf, flags, seq, ack, payload);
        buf
    }

    /// Serialize a UDP datagram for this flow into `buf` (cleared first).
    /// The UDP checksum is written as zero (checksum-disabled) on egress.
    pub fn write_udp_datagram(&self, buf: &mut BytesMut, payload: &[u8]) {
        let total_len = IP4_HEADER_SIZE + UDP_HEADER_SIZE + payload.len();
        buf.clear();
        buf.resize(total_len, 0);

        let udp = UdpHeader {
            src_port: self.src_port,
            dst_port: self.dst_port,
            length: (UDP_HEADER_SIZE + payload.len()) as u16,
            checksum: 0,
        };
        udp.encode(&mut buf[IP4_HEADER_SIZE..IP4_HEADER_SIZE + UDP_HEADER_SIZE]);
        buf[IP4_HEADER_SIZE + UDP_HEADER_SIZE..].copy_from_slice(payload);

        self.write_ipv4(buf, Protocol::Udp, total_len);
    }

    pub fn udp_datagram(&self, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(IP4_HEADER_SIZE + UDP_HEADER_SIZE + payload.len());
        self.write_udp_datagram(&mut buf, payload);
        buf
    }
}
