//! Session-level tests: UDP through the full engine, capture output, pcap
//! export.

use bytes::BytesMut;
use std::net::Ipv4Addr;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::UdpSocket;
use tunsniff::packet::ResponseTemplate;
use tunsniff::{write_pcap, Packet, Relay, RelayConfig, RelayHandle};

fn start_relay() -> (RelayHandle, DuplexStream) {
    let (device, near) = duplex(64 * 1024);
    let (read_half, write_half) = tokio::io::split(device);
    let handle = Relay::new(RelayConfig::default()).spawn(read_half, write_half);
    (handle, near)
}

async fn read_frame(device: &mut DuplexStream, pending: &mut BytesMut) -> Packet {
    loop {
        if pending.len() >= 4 {
            let total = u16::from_be_bytes([pending[2], pending[3]]) as usize;
            if total >= 20 && pending.len() >= total {
                return Packet::parse(pending.split_to(total)).expect("unparseable frame");
            }
        }
        let n = device.read_buf(pending).await.expect("device read");
        assert!(n > 0, "device closed while awaiting frame");
    }
}

#[tokio::test]
async fn udp_echo_with_capture_and_pcap_export() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 256];
        let (n, peer) = server.recv_from(&mut buf).await.unwrap();
        server.send_to(&buf[..n], peer).await.unwrap();
    });

    let (handle, mut device) = start_relay();
    let mut records = handle.take_capture_records().unwrap();
    let mut pending = BytesMut::new();

    let template = ResponseTemplate::new(
        Ipv4Addr::new(10, 0, 0, 2),
        5555,
        Ipv4Addr::new(127, 0, 0, 1),
        server_addr.port(),
    );
    let query = template.udp_datagram(b"echo me");
    device.write_all(&query).await.unwrap();

    let response = read_frame(&mut device, &mut pending).await;
    assert!(response.is_udp());
    assert_eq!(response.payload(), b"echo me");
    assert_eq!(response.udp().unwrap().dst_port, 5555);
    assert_eq!(response.udp().unwrap().checksum, 0);

    // Both directions hit the capture tap.
    let outbound = records.recv().await.unwrap();
    assert_eq!(outbound.ip_version, 4);
    assert_eq!(outbound.protocol, "UDP");
    assert_eq!(outbound.source_address, Ipv4Addr::new(10, 0, 0, 2));
    assert_eq!(outbound.source_port, 5555);
    assert_eq!(outbound.payload, b"echo me");
    assert!(outbound.timestamp_ms > 0);

    let inbound = records.recv().await.unwrap();
    assert_eq!(inbound.protocol, "UDP");
    assert_eq!(inbound.source_address, Ipv4Addr::new(127, 0, 0, 1));
    assert_eq!(inbound.source_port, server_addr.port());

    let store = handle.packet_store();
    assert_eq!(store.len(), 2);
    let snapshot = store.snapshot();

    let mut pcap = Vec::new();
    write_pcap(&mut pcap, &snapshot).unwrap();
    assert_eq!(&pcap[0..4], &[0xD4, 0xC3, 0xB2, 0xA1]);
    // 24-byte global header, then one record per stored packet.
    let first_len = 14 + snapshot[0].ip_header.len()
        + snapshot[0].transport_header.len()
        + snapshot[0].payload.len();
    let second_len = 14 + snapshot[1].ip_header.len()
        + snapshot[1].transport_header.len()
        + snapshot[1].payload.len();
    assert_eq!(pcap.len(), 24 + 16 + first_len + 16 + second_len);

    assert_eq!(handle.udp_flow_count(), 1);
    handle.shutdown().await;
    assert_eq!(handle.udp_flow_count(), 0);
}

#[tokio::test]
async fn disabled_store_ignores_traffic() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let (handle, mut device) = start_relay();
    handle.packet_store().disable();

    let template = ResponseTemplate::new(
        Ipv4Addr::new(10, 0, 0, 2),
        5555,
        Ipv4Addr::new(127, 0, 0, 1),
        server_addr.port(),
    );
    device.write_all(&template.udp_datagram(b"quiet")).await.unwrap();

    let mut buf = [0u8; 64];
    let (n, _) = server.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"quiet");
    assert!(handle.packet_store().is_empty());

    handle.shutdown().await;
}

#[tokio::test]
async fn device_eof_stops_the_session() {
    let (handle, device) = start_relay();
    drop(device);
    handle.closed().await;
    assert!(!handle.is_running());
    // EOF is the device going away, not an I/O failure.
    assert!(handle.take_fatal_error().is_none());
    // A later explicit shutdown is still a safe no-op.
    handle.shutdown().await;
    assert!(!handle.is_running());
}

#[tokio::test]
async fn fatal_device_write_error_tears_the_session_down() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        let (n, peer) = server.recv_from(&mut buf).await.unwrap();
        server.send_to(&buf[..n], peer).await.unwrap();
    });

    // Separate pipes for the two device halves so the write side can fail
    // while the read side stays open.
    let (read_device, mut read_far) = duplex(64 * 1024);
    let (write_device, write_far) = duplex(64 * 1024);
    let handle = Relay::new(RelayConfig::default()).spawn(read_device, write_device);
    drop(write_far);

    let template = ResponseTemplate::new(
        Ipv4Addr::new(10, 0, 0, 2),
        5555,
        Ipv4Addr::new(127, 0, 0, 1),
        server_addr.port(),
    );
    read_far.write_all(&template.udp_datagram(b"ping")).await.unwrap();

    // The echoed response cannot be written to the device; the failure must
    // stop the whole session and release every flow.
    handle.closed().await;
    assert!(!handle.is_running());
    assert!(handle.take_fatal_error().is_some());
    assert_eq!(handle.udp_flow_count(), 0);
    assert_eq!(handle.connection_count(), 0);
}
