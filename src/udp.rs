//! UDP relay: per-flow upstream sockets with idle eviction.
//!
//! No handshake. The first datagram for an unseen flow binds an upstream
//! socket and spawns a reader task that wraps responses into device-bound
//! frames; later datagrams reuse the socket. Flows are evicted after a
//! configurable idle period by the session's cleanup tick.

use crate::capture::CaptureTap;
use crate::packet::{Packet, ResponseTemplate};
use crate::pool::BufferPool;
use crate::relay::RelayStats;
use crate::table::FlowKey;
use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// One relayed UDP flow.
struct UdpFlow {
    key: FlowKey,
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    last_activity: Mutex<Instant>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl UdpFlow {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

pub struct UdpRelay {
    flows: DashMap<FlowKey, Arc<UdpFlow>>,
    pool: Arc<BufferPool>,
    device_tx: mpsc::Sender<BytesMut>,
    tap: CaptureTap,
    stats: Arc<RelayStats>,
    idle_timeout: Duration,
}

impl UdpRelay {
    pub fn new(
        pool: Arc<BufferPool>,
        device_tx: mpsc::Sender<BytesMut>,
        tap: CaptureTap,
        stats: Arc<RelayStats>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            flows: DashMap::new(),
            pool,
            device_tx,
            tap,
            stats,
            idle_timeout,
        }
    }

    /// Output half. Runs until the queue closes or shutdown is signalled.
    pub async fn run_output(
        self: Arc<Self>,
        mut packets: mpsc::Receiver<Packet>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let packet = tokio::select! {
                _ = shutdown.changed() => {
                    debug!("udp output: shutdown");
                    return;
                }
                packet = packets.recv() => match packet {
                    Some(packet) => packet,
                    None => return,
                },
            };
            self.handle_packet(packet).await;
        }
    }

    pub async fn handle_packet(self: &Arc<Self>, packet: Packet) {
        let Some(udp) = packet.udp() else {
            self.pool.release(packet.into_buffer());
            return;
        };
        let key = FlowKey::new(packet.ipv4.dst_addr, udp.dst_port, udp.src_port);

        let flow = match self.flows.get(&key) {
            Some(flow) => flow.clone(),
            None => match self.open_flow(key, &packet).await {
                Some(flow) => flow,
                None => {
                    self.pool.release(packet.into_buffer());
                    return;
                }
            },
        };

        flow.touch();
        if let Err(err) = flow.socket.send_to(packet.payload(), flow.remote).await {
            warn!(%key, %err, "upstream send failed, dropping flow");
            flow.close();
            self.flows.remove(&key);
        }
        self.pool.release(packet.into_buffer());
    }

    /// Bind the upstream socket for a new flow and start its reader.
    async fn open_flow(self: &Arc<Self>, key: FlowKey, packet: &Packet) -> Option<Arc<UdpFlow>> {
        let template = ResponseTemplate::from_request(packet)?;
        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => Arc::new(socket),
            Err(err) => {
                warn!(%key, %err, "udp bind failed");
                return None;
            }
        };
        let flow = Arc::new(UdpFlow {
            key,
            socket,
            remote: SocketAddr::from((key.dst_addr, key.dst_port)),
            last_activity: Mutex::new(Instant::now()),
            reader: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let relay = self.clone();
        let reader_flow = flow.clone();
        let handle = tokio::spawn(async move {
            relay.run_reader(reader_flow, template).await;
        });
        *flow.reader.lock() = Some(handle);

        self.flows.insert(key, flow.clone());
        self.stats.record_udp_session();
        debug!(%key, "udp flow created");
        Some(flow)
    }

    /// Per-flow reader: upstream datagrams become device-bound UDP frames.
    async fn run_reader(&self, flow: Arc<UdpFlow>, template: ResponseTemplate) {
        loop {
            let mut scratch = self.pool.acquire();
            scratch.resize(self.pool.buffer_capacity(), 0);
            match flow.socket.recv_from(&mut scratch).await {
                Ok((n, _)) => {
                    flow.touch();
                    let mut frame = self.pool.acquire();
                    template.write_udp_datagram(&mut frame, &scratch[..n]);
                    self.pool.release(scratch);
                    self.tap.observe_frame(&frame);
                    if self.device_tx.send(frame).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    self.pool.release(scratch);
                    debug!(key = %flow.key, %err, "upstream recv failed");
                    flow.close();
                    self.flows.remove(&flow.key);
                    return;
                }
            }
        }
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Evict flows idle past the timeout.
    pub fn cleanup(&self) {
        let expired: Vec<_> = self
            .flows
            .iter()
            .filter(|entry| entry.idle_for() > self.idle_timeout)
            .map(|entry| *entry.key())
            .collect();
        for key in expired {
            if let Some((_, flow)) = self.flows.remove(&key) {
                flow.close();
                trace!(%key, "udp flow evicted (idle)");
            }
        }
    }

    /// Close and drop every flow (shutdown path).
    pub fn close_all(&self) {
        let keys: Vec<_> = self.flows.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, flow)) = self.flows.remove(&key) {
                flow.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn relay(device_tx: mpsc::Sender<BytesMut>, idle: Duration) -> Arc<UdpRelay> {
        Arc::new(UdpRelay::new(
            Arc::new(BufferPool::new(2048, 8)),
            device_tx,
            CaptureTap::disabled(),
            Arc::new(RelayStats::new()),
            idle,
        ))
    }

    fn client_frame(dst: SocketAddr, payload: &[u8]) -> Packet {
        let SocketAddr::V4(dst) = dst else { panic!("v4 expected") };
        let template =
            ResponseTemplate::new(Ipv4Addr::new(10, 0, 0, 2), 5555, *dst.ip(), dst.port());
        Packet::parse(template.udp_datagram(payload)).unwrap()
    }

    #[tokio::test]
    async fn echo_flow_round_trips_through_upstream() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let (device_tx, mut device_rx) = mpsc::channel(4);
        let relay = relay(device_tx, Duration::from_secs(300));

        relay.handle_packet(client_frame(server_addr, b"ping")).await;
        assert_eq!(relay.flow_count(), 1);

        let mut buf = [0u8; 64];
        let (n, peer) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        server.send_to(b"pong", peer).await.unwrap();
        let frame = device_rx.recv().await.unwrap();
        let response = Packet::parse(frame).unwrap();
        assert!(response.is_udp());
        assert_eq!(response.payload(), b"pong");
        assert_eq!(response.ipv4.src_addr, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(response.udp().unwrap().src_port, server_addr.port());
        assert_eq!(response.udp().unwrap().dst_port, 5555);
        assert_eq!(response.udp().unwrap().checksum, 0);
    }

    #[tokio::test]
    async fn second_packet_reuses_the_flow() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let (device_tx, _device_rx) = mpsc::channel(4);
        let relay = relay(device_tx, Duration::from_secs(300));

        relay.handle_packet(client_frame(server_addr, b"one")).await;
        relay.handle_packet(client_frame(server_addr, b"two")).await;
        assert_eq!(relay.flow_count(), 1);

        let mut buf = [0u8; 64];
        let (n, first_peer) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"one");
        let (n, second_peer) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"two");
        assert_eq!(first_peer, second_peer);
    }

    #[tokio::test]
    async fn cleanup_evicts_idle_flows() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let (device_tx, _device_rx) = mpsc::channel(4);
        let relay = relay(device_tx, Duration::from_millis(0));

        relay.handle_packet(client_frame(server_addr, b"x")).await;
        assert_eq!(relay.flow_count(), 1);
        tokio::time::sleep(Duration::from_millis(5)).await;
        relay.cleanup();
        assert_eq!(relay.flow_count(), 0);
    }

    #[tokio::test]
    async fn close_all_drops_every_flow() {
        let server_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (device_tx, _device_rx) = mpsc::channel(4);
        let relay = relay(device_tx, Duration::from_secs(300));

        relay.handle_packet(client_frame(server_a.local_addr().unwrap(), b"a")).await;
        relay.handle_packet(client_frame(server_b.local_addr().unwrap(), b"b")).await;
        assert_eq!(relay.flow_count(), 2);
        relay.close_all();
        assert_eq!(relay.flow_count(), 0);
    }
}
