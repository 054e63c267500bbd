//! Relay session: configuration, counters, worker wiring, shutdown.
//!
//! `Relay::spawn` owns the whole engine for one device lifecycle. Every
//! shared resource (buffer pool, connection table, UDP flow map, capture
//! store) is created here and torn down by `RelayHandle::shutdown`; nothing
//! is process-global.

use crate::capture::{CaptureRecord, CaptureTap, PacketStore};
use crate::device::{device_reader, device_writer};
use crate::error::RelayError;
use crate::pool::BufferPool;
use crate::table::ConnectionTable;
use crate::tcp::TcpRelay;
use crate::udp::UdpRelay;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Capacity of pooled frame buffers. Must be at least the device MTU.
    pub buffer_capacity: usize,
    /// Buffers retained by the pool when idle.
    pub max_pooled_buffers: usize,
    /// Depth of the packet and frame queues between workers.
    pub queue_depth: usize,
    /// Depth of the capture record side channel.
    pub capture_queue_depth: usize,
    /// UDP flows idle longer than this are evicted.
    pub udp_idle_timeout: Duration,
    /// Interval of the periodic eviction tick.
    pub cleanup_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 16 * 1024,
            max_pooled_buffers: 64,
            queue_depth: 128,
            capture_queue_depth: 256,
            udp_idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
pub struct RelayStats {
    packets_read: AtomicU64,
    packets_written: AtomicU64,
    parse_errors: AtomicU64,
    dropped_frames: AtomicU64,
    tcp_opened: AtomicU64,
    tcp_established: AtomicU64,
    tcp_closed: AtomicU64,
    udp_sessions: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_packet_read(&self) {
        self.packets_read.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_packet_written(&self) {
        self.packets_written.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_dropped_frame(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_tcp_opened(&self) {
        self.tcp_opened.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_tcp_established(&self) {
        self.tcp_established.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_tcp_closed(&self) {
        self.tcp_closed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_udp_session(&self) {
        self.udp_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_read: self.packets_read.load(Ordering::Relaxed),
            packets_written: self.packets_written.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            tcp_opened: self.tcp_opened.load(Ordering::Relaxed),
            tcp_established: self.tcp_established.load(Ordering::Relaxed),
            tcp_closed: self.tcp_closed.load(Ordering::Relaxed),
            udp_sessions: self.udp_sessions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_read: u64,
    pub packets_written: u64,
    pub parse_errors: u64,
    pub dropped_frames: u64,
    pub tcp_opened: u64,
    pub tcp_established: u64,
    pub tcp_closed: u64,
    pub udp_sessions: u64,
}

/// Shared teardown state. Reached both from `RelayHandle::shutdown` and
/// from the device tasks when the interface fails, so stopping must be safe
/// from any of them, concurrently.
struct SessionCore {
    running: AtomicBool,
    signal: watch::Sender<bool>,
    pool: Arc<BufferPool>,
    table: Arc<ConnectionTable>,
    udp: Arc<UdpRelay>,
    fatal: parking_lot::Mutex<Option<RelayError>>,
}

impl SessionCore {
    fn record_fatal(&self, err: RelayError) {
        let mut slot = self.fatal.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Close every flow, release every buffer, then signal the workers to
    /// exit. First caller wins; later calls are no-ops. The signal goes out
    /// last so observers of `closed()` see a fully torn-down session.
    async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.table.close_all().await;
        self.udp.close_all();
        self.pool.clear();
        let _ = self.signal.send(true);
        info!("relay stopped");
    }
}

/// Relay engine, not yet attached to a device.
pub struct Relay {
    config: RelayConfig,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    /// Attach the device halves and start every worker. One call per
    /// lifecycle; the returned handle is the only way to stop the engine.
    pub fn spawn<R, W>(self, device_read: R, device_write: W) -> RelayHandle
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let config = self.config;
        let pool = Arc::new(BufferPool::new(
            config.buffer_capacity,
            config.max_pooled_buffers,
        ));
        let table = Arc::new(ConnectionTable::new());
        let store = Arc::new(PacketStore::new());
        let stats = Arc::new(RelayStats::new());
        let (record_tx, record_rx) = mpsc::channel(config.capture_queue_depth);
        let tap = CaptureTap::new(Some(record_tx), Some(store.clone()));

        let (device_tx, device_rx) = mpsc::channel(config.queue_depth);
        let (tcp_tx, tcp_rx) = mpsc::channel(config.queue_depth);
        let (udp_tx, udp_rx) = mpsc::channel(config.queue_depth);
        let (signal, shutdown) = watch::channel(false);

        let tcp = Arc::new(TcpRelay::new(
            table.clone(),
            pool.clone(),
            device_tx.clone(),
            tap.clone(),
            stats.clone(),
        ));
        let udp = Arc::new(UdpRelay::new(
            pool.clone(),
            device_tx,
            tap.clone(),
            stats.clone(),
            config.udp_idle_timeout,
        ));

        let core = Arc::new(SessionCore {
            running: AtomicBool::new(true),
            signal,
            pool: pool.clone(),
            table: table.clone(),
            udp: udp.clone(),
            fatal: parking_lot::Mutex::new(None),
        });

        // A failed or vanished device ends the session: either loop
        // returning runs the full teardown unless shutdown already did.
        {
            let pool = pool.clone();
            let stats = stats.clone();
            let shutdown = shutdown.clone();
            let core = core.clone();
            tokio::spawn(async move {
                if let Err(err) =
                    device_reader(device_read, pool, tap, tcp_tx, udp_tx, stats, shutdown).await
                {
                    warn!(%err, "device reader failed, shutting down");
                    core.record_fatal(err);
                }
                core.stop().await;
            });
        }
        {
            let pool = pool.clone();
            let stats = stats.clone();
            let shutdown = shutdown.clone();
            let core = core.clone();
            tokio::spawn(async move {
                if let Err(err) =
                    device_writer(device_write, pool, device_rx, stats, shutdown).await
                {
                    warn!(%err, "device writer failed, shutting down");
                    core.record_fatal(err);
                }
                core.stop().await;
            });
        }
        tokio::spawn(tcp.clone().run_output(tcp_rx, shutdown.clone()));
        tokio::spawn(udp.clone().run_output(udp_rx, shutdown.clone()));
        {
            let udp = udp.clone();
            let mut shutdown = shutdown.clone();
            let interval = config.cleanup_interval;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tick.tick() => udp.cleanup(),
                    }
                }
            });
        }

        info!("relay started");
        RelayHandle {
            core,
            store,
            stats,
            stopped: shutdown,
            records: parking_lot::Mutex::new(Some(record_rx)),
        }
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}

/// Running relay session.
pub struct RelayHandle {
    core: Arc<SessionCore>,
    store: Arc<PacketStore>,
    stats: Arc<RelayStats>,
    stopped: watch::Receiver<bool>,
    records: parking_lot::Mutex<Option<mpsc::Receiver<CaptureRecord>>>,
}

impl RelayHandle {
    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    /// Resolves once the session has stopped, whether by `shutdown` or by a
    /// device failure. Check `take_fatal_error` to distinguish.
    pub async fn closed(&self) {
        let mut stopped = self.stopped.clone();
        loop {
            if *stopped.borrow_and_update() {
                return;
            }
            if stopped.changed().await.is_err() {
                return;
            }
        }
    }

    /// The device error that ended the session, if one did. Absent after a
    /// requested shutdown or plain device EOF.
    pub fn take_fatal_error(&self) -> Option<RelayError> {
        self.core.fatal.lock().take()
    }

    /// Capture record stream. Available once; records are dropped when no
    /// consumer keeps up (or none took the receiver).
    pub fn take_capture_records(&self) -> Option<mpsc::Receiver<CaptureRecord>> {
        self.records.lock().take()
    }

    pub fn packet_store(&self) -> &Arc<PacketStore> {
        &self.store
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn connection_count(&self) -> usize {
        self.core.table.len()
    }

    pub fn udp_flow_count(&self) -> usize {
        self.core.udp.flow_count()
    }

    /// Stop every worker, close every flow, release every buffer. Safe to
    /// call concurrently with active I/O and more than once, including
    /// after a device failure already stopped the session.
    pub async fn shutdown(&self) {
        self.core.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn config_defaults_are_sane() {
        let config = RelayConfig::default();
        assert!(config.buffer_capacity >= 1500);
        assert!(config.queue_depth > 0);
        assert_eq!(config.udp_idle_timeout, Duration::from_secs(300));
        assert_eq!(config.cleanup_interval, Duration::from_secs(30));
    }

    #[test]
    fn stats_snapshot_reflects_counters() {
        let stats = RelayStats::new();
        stats.record_packet_read();
        stats.record_packet_read();
        stats.record_tcp_opened();
        let snap = stats.snapshot();
        assert_eq!(snap.packets_read, 2);
        assert_eq!(snap.tcp_opened, 1);
        assert_eq!(snap.packets_written, 0);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (device, _far) = duplex(4096);
        let (read_half, write_half) = tokio::io::split(device);
        let handle = Relay::default().spawn(read_half, write_half);
        assert!(handle.is_running());
        handle.shutdown().await;
        assert!(!handle.is_running());
        handle.shutdown().await;
        assert!(!handle.is_running());
        assert_eq!(handle.connection_count(), 0);
        assert_eq!(handle.udp_flow_count(), 0);
    }

    #[tokio::test]
    async fn capture_receiver_is_taken_once() {
        let (device, _far) = duplex(4096);
        let (read_half, write_half) = tokio::io::split(device);
        let handle = Relay::default().spawn(read_half, write_half);
        assert!(handle.take_capture_records().is_some());
        assert!(handle.take_capture_records().is_none());
        handle.shutdown().await;
    }
}
