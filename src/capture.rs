//! Capture sink: per-packet records, the raw-packet store, and
//! pcap-compatible encoding.
//!
//! Capture never blocks the data path. Records are pushed with `try_send`
//! and dropped when the consumer lags; the store append is a short
//! uncontended lock.

use crate::packet::{
    Ipv4Header, Packet, Protocol, TcpHeader, TransportHeader, UdpHeader, IP4_HEADER_SIZE,
    UDP_HEADER_SIZE,
};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::trace;

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One observed packet, summarized for consumers that want flow metadata
/// rather than raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    pub ip_version: u8,
    pub protocol: &'static str,
    pub source_address: Ipv4Addr,
    pub source_port: u16,
    /// Reverse-lookup result; populated by consumers, never on the data path.
    pub hostname: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp_ms: u64,
}

/// One observed packet kept byte-exact for pcap export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub timestamp_ms: u64,
    pub ip_header: Vec<u8>,
    pub transport_header: Vec<u8>,
    pub payload: Vec<u8>,
}

impl RawPacket {
    fn wire_len(&self) -> usize {
        LINK_LAYER_HEADER.len() + self.ip_header.len() + self.transport_header.len() + self.payload.len()
    }
}

/// Session-owned accumulator of raw packets. Appends are ignored once
/// disabled, so export can run against a stable snapshot while traffic
/// continues.
pub struct PacketStore {
    packets: Mutex<Vec<RawPacket>>,
    enabled: AtomicBool,
}

impl PacketStore {
    pub fn new() -> Self {
        Self {
            packets: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn add(&self, packet: RawPacket) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        self.packets.lock().push(packet);
    }

    /// Stop accepting packets. One-way for the life of the store.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<RawPacket> {
        self.packets.lock().clone()
    }

    pub fn clear(&self) {
        self.packets.lock().clear();
    }
}

impl Default for PacketStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Observation point shared by the device reader and the relay output
/// halves. Both sides of every flow pass through here.
#[derive(Clone)]
pub struct CaptureTap {
    records: Option<mpsc::Sender<CaptureRecord>>,
    store: Option<Arc<PacketStore>>,
}

impl CaptureTap {
    pub fn new(
        records: Option<mpsc::Sender<CaptureRecord>>,
        store: Option<Arc<PacketStore>>,
    ) -> Self {
        Self { records, store }
    }

    /// Tap with both sinks disconnected.
    pub fn disabled() -> Self {
        Self { records: None, store: None }
    }

    /// Record a parsed device-origin packet.
    pub fn observe_packet(&self, packet: &Packet) {
        let now = epoch_millis();
        if let Some(store) = &self.store {
            store.add(RawPacket {
                timestamp_ms: now,
                ip_header: packet.ip_header_bytes().to_vec(),
                transport_header: packet.transport_header_bytes().to_vec(),
                payload: packet.payload().to_vec(),
            });
        }
        if let Some(records) = &self.records {
            let (protocol, source_port) = match &packet.transport {
                TransportHeader::Tcp(h) => ("TCP", h.src_port),
                TransportHeader::Udp(h) => ("UDP", h.src_port),
                TransportHeader::Unknown(_) => ("OTHER", 0),
            };
            let record = CaptureRecord {
                ip_version: packet.ipv4.version,
                protocol,
                source_address: packet.ipv4.src_addr,
                source_port,
                hostname: None,
                payload: packet.payload().to_vec(),
                timestamp_ms: now,
            };
            if records.try_send(record).is_err() {
                trace!("capture record channel full, dropping record");
            }
        }
    }

    /// Record a device-bound frame built by a relay half.
    pub fn observe_frame(&self, frame: &[u8]) {
        if self.records.is_none() && self.store.is_none() {
            return;
        }
        let Ok(ipv4) = Ipv4Header::parse(frame) else {
            return;
        };
        let rest = &frame[IP4_HEADER_SIZE..];
        let (protocol, source_port, transport_len) = match ipv4.protocol {
            Protocol::Tcp => match TcpHeader::parse(rest) {
                Ok(h) => ("TCP", h.src_port, h.header_len()),
                Err(_) => return,
            },
            Protocol::Udp => match UdpHeader::parse(rest) {
                Ok(h) => ("UDP", h.src_port, UDP_HEADER_SIZE),
                Err(_) => return,
            },
            Protocol::Other(_) => ("OTHER", 0, 0),
        };
        let payload_offset = IP4_HEADER_SIZE + transport_len;
        let end = (ipv4.total_length as usize).min(frame.len());
        let payload = if payload_offset < end { &frame[payload_offset..end] } else { &[] };
        let now = epoch_millis();

        if let Some(store) = &self.store {
            store.add(RawPacket {
                timestamp_ms: now,
                ip_header: frame[..IP4_HEADER_SIZE].to_vec(),
                transport_header: frame[IP4_HEADER_SIZE..payload_offset].to_vec(),
                payload: payload.to_vec(),
            });
        }
        if let Some(records) = &self.records {
            let record = CaptureRecord {
                ip_version: ipv4.version,
                protocol,
                source_address: ipv4.src_addr,
                source_port,
                hostname: None,
                payload: payload.to_vec(),
                timestamp_ms: now,
            };
            if records.try_send(record).is_err() {
                trace!("capture record channel full, dropping record");
            }
        }
    }
}

// pcap encoding. Multi-byte header fields are little-endian; readers learn
// the byte order from the magic.

const PCAP_MAGIC: u32 = 0xA1B2_C3D4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const PCAP_SNAPLEN: u32 = 0xFFFF;
const PCAP_LINKTYPE_ETHERNET: u32 = 1;

// Synthetic Ethernet header: placeholder MACs, EtherType IPv4.
const LINK_LAYER_HEADER: [u8; 14] = [
    0x09, 0x09, 0x09, 0x09, 0x09, 0x09,
    0x09, 0x09, 0x09, 0x09, 0x09, 0x09,
    0x08, 0x00,
];

fn write_pcap_global_header<W: Write>(out: &mut W) -> io::Result<()> {
    out.write_all(&PCAP_MAGIC.to_le_bytes())?;
    out.write_all(&PCAP_VERSION_MAJOR.to_le_bytes())?;
    out.write_all(&PCAP_VERSION_MINOR.to_le_bytes())?;
    out.write_all(&0i32.to_le_bytes())?; // thiszone
    out.write_all(&0u32.to_le_bytes())?; // sigfigs
    out.write_all(&PCAP_SNAPLEN.to_le_bytes())?;
    out.write_all(&PCAP_LINKTYPE_ETHERNET.to_le_bytes())?;
    Ok(())
}

fn write_pcap_record<W: Write>(out: &mut W, packet: &RawPacket) -> io::Result<()> {
    let ts_sec = (packet.timestamp_ms / 1000) as u32;
    let ts_usec = ((packet.timestamp_ms % 1000) * 1000) as u32;
    let wire_len = packet.wire_len() as u32;
    out.write_all(&ts_sec.to_le_bytes())?;
    out.write_all(&ts_usec.to_le_bytes())?;
    out.write_all(&wire_len.to_le_bytes())?; // incl_len
    out.write_all(&wire_len.to_le_bytes())?; // orig_len
    out.write_all(&LINK_LAYER_HEADER)?;
    out.write_all(&packet.ip_header)?;
    out.write_all(&packet.transport_header)?;
    out.write_all(&packet.payload)?;
    Ok(())
}

/// Encode `packets` as a complete pcap stream into `out`.
pub fn write_pcap<W: Write>(out: &mut W, packets: &[RawPacket]) -> io::Result<()> {
    write_pcap_global_header(out)?;
    for packet in packets {
        write_pcap_record(out, packet)?;
    }
    Ok(())
}
