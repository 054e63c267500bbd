//! Per-flow TCP state and the concurrent connection table.

use crate::packet::ResponseTemplate;
use dashmap::DashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Identity of one TCP or UDP flow as seen from the virtual interface.
/// The client address is fixed per device, so destination plus the two
/// ports is unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub dst_addr: Ipv4Addr,
    pub dst_port: u16,
    pub src_port: u16,
}

impl FlowKey {
    pub fn new(dst_addr: Ipv4Addr, dst_port: u16, src_port: u16) -> Self {
        Self { dst_addr, dst_port, src_port }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.dst_addr, self.dst_port, self.src_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcbState {
    /// SYN seen, upstream connect in flight.
    SynSent,
    /// Connect completed, SYN+ACK sent, awaiting the client's ACK.
    SynReceived,
    Established,
    /// Client sent FIN while upstream data may still arrive.
    CloseWait,
    /// Our FIN is out, awaiting the final ACK.
    LastAck,
    Closed,
}

/// Transmission control block for one relayed flow.
///
/// Sequence fields mirror the device side of the conversation: `my_seq` is
/// the next sequence number we stamp on device-bound segments, `my_ack` the
/// next client byte we expect, `their_ack` the highest ack the client has
/// sent us.
pub struct Tcb {
    pub key: FlowKey,
    pub state: TcbState,
    pub my_seq: u32,
    pub my_ack: u32,
    pub their_ack: u32,
    pub template: ResponseTemplate,
    /// True while upstream may still deliver data for this flow.
    pub waiting_for_network_data: bool,
    pub write_half: Option<OwnedWriteHalf>,
    /// Held here between connect completion and ESTABLISHED, when the
    /// per-flow reader task takes it.
    pub read_half: Option<OwnedReadHalf>,
    pub reader: Option<JoinHandle<()>>,
}

impl Tcb {
    pub fn new(key: FlowKey, template: ResponseTemplate, isn: u32, my_ack: u32) -> Self {
        Self {
            key,
            state: TcbState::SynSent,
            my_seq: isn,
            my_ack,
            their_ack: 0,
            template,
            waiting_for_network_data: false,
            write_half: None,
            read_half: None,
            reader: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == TcbState::Closed
    }

    /// Tear the flow down: stop the reader, drop both socket halves, mark
    /// Closed. Safe to call more than once.
    pub fn close(&mut self) {
        if self.state == TcbState::Closed {
            return;
        }
        self.state = TcbState::Closed;
        self.waiting_for_network_data = false;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.write_half = None;
        self.read_half = None;
        debug!(key = %self.key, "tcb closed");
    }
}

pub type SharedTcb = Arc<Mutex<Tcb>>;

/// Concurrent map of active TCBs, keyed by flow.
pub struct ConnectionTable {
    flows: DashMap<FlowKey, SharedTcb>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self { flows: DashMap::new() }
    }

    pub fn get(&self, key: &FlowKey) -> Option<SharedTcb> {
        self.flows.get(key).map(|e| e.clone())
    }

    pub fn insert(&self, key: FlowKey, tcb: Tcb) -> SharedTcb {
        let shared = Arc::new(Mutex::new(tcb));
        self.flows.insert(key, shared.clone());
        shared
    }

    pub fn remove(&self, key: &FlowKey) -> Option<SharedTcb> {
        self.flows.remove(key).map(|(_, tcb)| tcb)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Close and drop every flow (shutdown path).
    pub async fn close_all(&self) {
        let keys: Vec<_> = self.flows.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, tcb)) = self.flows.remove(&key) {
                tcb.lock().await.close();
            }
        }
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}
