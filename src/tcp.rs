//! TCP relay: output half (device to network) and per-flow input readers
//! (network to device).
//!
//! The output half consumes parsed TCP packets from the device queue and
//! drives the per-flow state machine: SYN opens the upstream socket, FIN and
//! ACK walk the teardown and data paths, RST tears the flow down. The input
//! side is one reader task per established flow, turning upstream bytes into
//! PSH+ACK segments toward the device. All sequence/ack bookkeeping happens
//! under the flow's exclusive lock.

use crate::capture::CaptureTap;
use crate::error::RelayError;
use crate::packet::{Packet, ResponseTemplate, TcpFlags, TcpHeader};
use crate::pool::BufferPool;
use crate::relay::RelayStats;
use crate::table::{ConnectionTable, FlowKey, SharedTcb, Tcb, TcbState};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

pub struct TcpRelay {
    table: Arc<ConnectionTable>,
    pool: Arc<BufferPool>,
    device_tx: mpsc::Sender<BytesMut>,
    tap: CaptureTap,
    stats: Arc<RelayStats>,
}

impl TcpRelay {
    pub fn new(
        table: Arc<ConnectionTable>,
        pool: Arc<BufferPool>,
        device_tx: mpsc::Sender<BytesMut>,
        tap: CaptureTap,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self { table, pool, device_tx, tap, stats }
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
                    debug!("tcp output: shutdown");
                    return;
                }
                packet = packets.recv() => match packet {
                    Some(packet) => packet,
                    None => return,
                },
            };
            self.dispatch(packet).await;
        }
    }

    /// Flag dispatch in SYN / RST / FIN / ACK precedence order.
    async fn dispatch(&self, packet: Packet) {
        let Some(tcp) = packet.tcp().cloned() else {
            self.pool.release(packet.into_buffer());
            return;
        };
        let key = FlowKey::new(packet.ipv4.dst_addr, tcp.dst_port, tcp.src_port);
        let existing = self.table.get(&key);

        if tcp.flags.syn {
            match existing {
                None => self.initialize_connection(key, &packet, &tcp).await,
                Some(tcb) => self.process_duplicate_syn(&tcb, &tcp).await,
            }
        } else if tcp.flags.rst {
            if let Some(tcb) = existing {
                self.close_flow(&tcb).await;
            }
        } else if tcp.flags.fin {
            match existing {
                Some(tcb) => self.process_fin(&tcb, &tcp).await,
                None => self.reset_unknown_flow(&packet, &tcp).await,
            }
        } else if tcp.flags.ack {
            match existing {
                Some(tcb) => self.process_ack(&tcb, &packet, &tcp).await,
                None => self.reset_unknown_flow(&packet, &tcp).await,
            }
        }

        self.pool.release(packet.into_buffer());
    }

    /// First SYN for an unseen flow: create the TCB and start the upstream
    /// connect. The SYN+ACK goes out when the connect completes.
    async fn initialize_connection(&self, key: FlowKey, packet: &Packet, tcp: &TcpHeader) {
        let Some(template) = ResponseTemplate::from_request(packet) else {
            return;
        };
        let isn = rand::random::<u32>() & 0x7FFF_FFFF;
        let mut tcb = Tcb::new(key, template, isn, tcp.seq.wrapping_add(1));
        tcb.their_ack = tcp.ack;
        let shared = self.table.insert(key, tcb);
        self.stats.record_tcp_opened();
        debug!(%key, "tcp flow created");

        let relay = self.clone_parts();
        let remote = SocketAddr::from((key.dst_addr, key.dst_port));
        tokio::spawn(async move {
            relay.finish_connect(key, shared, remote).await;
        });
    }

    fn clone_parts(&self) -> ConnectedRelay {
        ConnectedRelay {
            table: self.table.clone(),
            pool: self.pool.clone(),
            device_tx: self.device_tx.clone(),
            tap: self.tap.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Client retransmitted its SYN. In SYN_SENT only the expected ack moves;
    /// anywhere else the flow is reset.
    async fn process_duplicate_syn(&self, shared: &SharedTcb, tcp: &TcpHeader) {
        let mut tcb = shared.lock().await;
        if tcb.state == TcbState::SynSent {
            tcb.my_ack = tcp.seq.wrapping_add(1);
            return;
        }
        let ack = tcb.my_ack.wrapping_add(1);
        let frame = self.build_segment(&tcb.template, TcpFlags::rst_only(), 0, ack, &[]);
        drop(tcb);
        self.emit(frame).await;
        self.close_flow(shared).await;
    }

    async fn process_fin(&self, shared: &SharedTcb, tcp: &TcpHeader) {
        let mut tcb = shared.lock().await;
        if tcb.is_closed() {
            return;
        }
        tcb.my_ack = tcp.seq.wrapping_add(1);
        tcb.their_ack = tcp.ack;

        let frame = if tcb.waiting_for_network_data {
            tcb.state = TcbState::CloseWait;
            self.build_segment(&tcb.template, TcpFlags::ack_only(), tcb.my_seq, tcb.my_ack, &[])
        } else {
            tcb.state = TcbState::LastAck;
            let frame =
                self.build_segment(&tcb.template, TcpFlags::fin_ack(), tcb.my_seq, tcb.my_ack, &[]);
            tcb.my_seq = tcb.my_seq.wrapping_add(1); // FIN occupies one sequence slot
            frame
        };
        drop(tcb);
        self.emit(frame).await;
    }

    async fn process_ack(&self, shared: &SharedTcb, packet: &Packet, tcp: &TcpHeader) {
        let payload = packet.payload();
        let mut tcb = shared.lock().await;
        match tcb.state {
            TcbState::Closed => return,
            TcbState::SynReceived => {
                tcb.state = TcbState::Established;
                tcb.waiting_for_network_data = true;
                self.stats.record_tcp_established();
                debug!(key = %tcb.key, "tcp flow established");
                if let Some(read_half) = tcb.read_half.take() {
                    let relay = self.clone_parts();
                    let key = tcb.key;
                    let flow = shared.clone();
                    tcb.reader =
                        Some(tokio::spawn(async move {
                            relay.run_reader(key, flow, read_half).await;
                        }));
                }
            }
            TcbState::LastAck => {
                let key = tcb.key;
                tcb.close();
                drop(tcb);
                self.table.remove(&key);
                self.stats.record_tcp_closed();
                return;
            }
            _ => {}
        }

        tcb.their_ack = tcp.ack;
        if payload.is_empty() {
            return;
        }

        // Forward to upstream, fully flushed, before acknowledging.
        let write_result = match tcb.write_half.as_mut() {
            Some(half) => half.write_all(payload).await,
            None => Err(std::io::Error::from(std::io::ErrorKind::NotConnected)),
        };
        if let Err(err) = write_result {
            warn!(key = %tcb.key, %err, "upstream write failed");
            let frame = self.build_segment(
                &tcb.template,
                TcpFlags::rst_only(),
                0,
                tcb.my_ack.wrapping_add(payload.len() as u32),
                &[],
            );
            drop(tcb);
            self.emit(frame).await;
            self.close_flow(shared).await;
            return;
        }

        tcb.my_ack = tcp.seq.wrapping_add(payload.len() as u32);
        let frame =
            self.build_segment(&tcb.template, TcpFlags::ack_only(), tcb.my_seq, tcb.my_ack, &[]);
        drop(tcb);
        self.emit(frame).await;
    }

    /// Non-SYN segment for a flow we do not know: answer with RST acking
    /// one past the segment's sequence number.
    async fn reset_unknown_flow(&self, packet: &Packet, tcp: &TcpHeader) {
        let Some(template) = ResponseTemplate::from_request(packet) else {
            return;
        };
        let frame = self.build_segment(
            &template,
            TcpFlags::rst_only(),
            0,
            tcp.seq.wrapping_add(1),
            &[],
        );
        self.emit(frame).await;
    }

    async fn close_flow(&self, shared: &SharedTcb) {
        let mut tcb = shared.lock().await;
        if tcb.is_closed() {
            return;
        }
        let key = tcb.key;
        tcb.close();
        drop(tcb);
        self.table.remove(&key);
        self.stats.record_tcp_closed();
    }

    fn build_segment(
        &self,
        template: &ResponseTemplate,
        flags: TcpFlags,
        seq: u32,
        ack: u32,
        payload: &[u8],
    ) -> BytesMut {
        let mut buf = self.pool.acquire();
        template.write_tcp_segment(&mut buf, flags, seq, ack, payload);
        buf
    }

    async fn emit(&self, frame: BytesMut) {
        self.tap.observe_frame(&frame);
        if self.device_tx.send(frame).await.is_err() {
            trace!("device queue closed, dropping frame");
        }
    }
}

/// The pieces of the relay a spawned per-flow task needs.
struct ConnectedRelay {
    table: Arc<ConnectionTable>,
    pool: Arc<BufferPool>,
    device_tx: mpsc::Sender<BytesMut>,
    tap: CaptureTap,
    stats: Arc<RelayStats>,
}

impl ConnectedRelay {
    /// Complete the upstream connect for a flow in SYN_SENT. Success sends
    /// the SYN+ACK; failure resets the flow toward the device.
    async fn finish_connect(&self, key: FlowKey, shared: SharedTcb, remote: SocketAddr) {
        match TcpStream::connect(remote).await {
            Ok(stream) => {
                let (read_half, write_half) = stream.into_split();
                let mut tcb = shared.lock().await;
                if tcb.is_closed() {
                    return;
                }
                tcb.read_half = Some(read_half);
                tcb.write_half = Some(write_half);
                tcb.state = TcbState::SynReceived;
                let frame = self.build_segment(
                    &tcb.template,
                    TcpFlags::syn_ack(),
                    tcb.my_seq,
                    tcb.my_ack,
                    &[],
                );
                tcb.my_seq = tcb.my_seq.wrapping_add(1); // SYN occupies one sequence slot
                drop(tcb);
                self.emit(frame).await;
            }
            Err(err) => {
                let err = RelayError::Connect(err);
                debug!(%key, %err, "upstream connect failed");
                let mut tcb = shared.lock().await;
                if tcb.is_closed() {
                    return;
                }
                let frame = self.build_segment(
                    &tcb.template,
                    TcpFlags::rst_only(),
                    0,
                    tcb.my_ack,
                    &[],
                );
                tcb.close();
                drop(tcb);
                self.emit(frame).await;
                self.table.remove(&key);
                self.stats.record_tcp_closed();
            }
        }
    }

    /// Per-flow reader: upstream bytes become PSH+ACK segments until EOF or
    /// error.
    async fn run_reader(
        &self,
        key: FlowKey,
        shared: SharedTcb,
        mut read_half: tokio::net::tcp::OwnedReadHalf,
    ) {
        loop {
            let mut buf = self.pool.acquire();
            buf.resize(self.pool.buffer_capacity(), 0);
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    self.pool.release(buf);
                    let mut tcb = shared.lock().await;
                    if tcb.is_closed() {
                        return;
                    }
                    tcb.waiting_for_network_data = false;
                    if tcb.state == TcbState::CloseWait {
                        tcb.state = TcbState::LastAck;
                        let frame = self.build_segment(
                            &tcb.template,
                            TcpFlags::fin_only(),
                            tcb.my_seq,
                            tcb.my_ack,
                            &[],
                        );
                        tcb.my_seq = tcb.my_seq.wrapping_add(1);
                        drop(tcb);
                        self.emit(frame).await;
                    }
                    return;
                }
                Ok(n) => {
                    buf.truncate(n);
                    let mut tcb = shared.lock().await;
                    if tcb.is_closed() {
                        self.pool.release(buf);
                        return;
                    }
                    let frame = self.build_segment(
                        &tcb.template,
                        TcpFlags::psh_ack(),
                        tcb.my_seq,
                        tcb.my_ack,
                        &buf,
                    );
                    tcb.my_seq = tcb.my_seq.wrapping_add(n as u32);
                    drop(tcb);
                    self.pool.release(buf);
                    self.emit(frame).await;
                }
                Err(err) => {
                    self.pool.release(buf);
                    debug!(%key, %err, "upstream read failed");
                    let mut tcb = shared.lock().await;
                    if tcb.is_closed() {
                        return;
                    }
                    let frame = self.build_segment(
                        &tcb.template,
                        TcpFlags::rst_only(),
                        0,
                        tcb.my_ack,
                        &[],
                    );
                    tcb.close();
                    drop(tcb);
                    self.emit(frame).await;
                    self.table.remove(&key);
                    self.stats.record_tcp_closed();
                    return;
                }
            }
        }
    }

    fn build_segment(
        &self,
        template: &ResponseTemplate,
        flags: TcpFlags,
        seq: u32,
        ack: u32,
        payload: &[u8],
    ) -> BytesMut {
        let mut buf = self.pool.acquire();
        template.write_tcp_segment(&mut buf, flags, seq, ack, payload);
        buf
    }

    async fn emit(&self, frame: BytesMut) {
        self.tap.observe_frame(&frame);
        if self.device_tx.send(frame).await.is_err() {
            trace!("device queue closed, dropping frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const REMOTE: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

    fn relay_under_test() -> (
        Arc<TcpRelay>,
        mpsc::Receiver<BytesMut>,
        Arc<ConnectionTable>,
        Arc<RelayStats>,
    ) {
        let table = Arc::new(ConnectionTable::new());
        let (device_tx, device_rx) = mpsc::channel(8);
        let stats = Arc::new(RelayStats::new());
        let relay = Arc::new(TcpRelay::new(
            table.clone(),
            Arc::new(BufferPool::new(2048, 8)),
            device_tx,
            CaptureTap::disabled(),
            stats.clone(),
        ));
        (relay, device_rx, table, stats)
    }

    fn flow_key() -> FlowKey {
        FlowKey::new(REMOTE, 80, 5555)
    }

    fn tcb_in(table: &ConnectionTable, state: TcbState) -> SharedTcb {
        let template = ResponseTemplate::new(REMOTE, 80, CLIENT, 5555);
        let mut tcb = Tcb::new(flow_key(), template, 1000, 101);
        tcb.state = state;
        table.insert(flow_key(), tcb)
    }

    fn client_segment(flags: TcpFlags, seq: u32, payload: &[u8]) -> Packet {
        let template = ResponseTemplate::new(CLIENT, 5555, REMOTE, 80);
        Packet::parse(template.tcp_segment(flags, seq, 0, payload)).unwrap()
    }

    #[tokio::test]
    async fn retransmitted_syn_in_syn_sent_only_moves_the_ack() {
        let (relay, mut device_rx, table, _stats) = relay_under_test();
        let shared = tcb_in(&table, TcbState::SynSent);

        let syn = TcpFlags { syn: true, ..Default::default() };
        relay.dispatch(client_segment(syn, 200, &[])).await;

        let tcb = shared.lock().await;
        assert_eq!(tcb.state, TcbState::SynSent);
        assert_eq!(tcb.my_ack, 201);
        drop(tcb);
        assert!(device_rx.try_recv().is_err());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn retransmitted_syn_on_live_flow_resets_it() {
        let (relay, mut device_rx, table, stats) = relay_under_test();
        let shared = tcb_in(&table, TcbState::Established);

        let syn = TcpFlags { syn: true, ..Default::default() };
        relay.dispatch(client_segment(syn, 200, &[])).await;

        let response = Packet::parse(device_rx.try_recv().unwrap()).unwrap();
        let tcp = response.tcp().unwrap();
        assert!(tcp.flags.rst);
        assert_eq!(tcp.seq, 0);
        assert_eq!(tcp.ack, 102);
        assert!(table.is_empty());
        assert!(shared.lock().await.is_closed());
        assert_eq!(stats.snapshot().tcp_closed, 1);
    }

    #[tokio::test]
    async fn client_rst_closes_the_flow_silently() {
        let (relay, mut device_rx, table, stats) = relay_under_test();
        let shared = tcb_in(&table, TcbState::Established);

        relay.dispatch(client_segment(TcpFlags::rst_only(), 101, &[])).await;

        assert!(device_rx.try_recv().is_err());
        assert!(table.is_empty());
        assert!(shared.lock().await.is_closed());
        assert_eq!(stats.snapshot().tcp_closed, 1);
    }

    #[tokio::test]
    async fn unknown_flow_rst_acks_one_past_the_sequence() {
        let (relay, mut device_rx, table, _stats) = relay_under_test();

        relay.dispatch(client_segment(TcpFlags::psh_ack(), 500, b"stray")).await;

        let response = Packet::parse(device_rx.try_recv().unwrap()).unwrap();
        let tcp = response.tcp().unwrap();
        assert!(tcp.flags.rst);
        assert_eq!(tcp.seq, 0);
        assert_eq!(tcp.ack, 501);
        assert!(table.is_empty());
    }
}
