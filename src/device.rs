//! Device loops bridging the virtual interface to the relay queues.
//!
//! The reader pulls raw frames off the device, parses and routes them; the
//! writer drains device-bound frames and recycles their buffers. Both loops
//! are generic over the I/O halves so tests run them over an in-memory
//! duplex pipe.

use crate::capture::CaptureTap;
use crate::error::{RelayError, Result};
use crate::packet::Packet;
use crate::pool::BufferPool;
use crate::relay::RelayStats;
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// Read frames from the device, parse, capture, and route by protocol.
/// One device read yields one IP packet. Returns when the device reports
/// EOF, shutdown is signalled, or a fatal device error occurs.
pub async fn device_reader<R>(
    mut device: R,
    pool: Arc<BufferPool>,
    tap: CaptureTap,
    tcp_tx: mpsc::Sender<Packet>,
    udp_tx: mpsc::Sender<Packet>,
    stats: Arc<RelayStats>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut buf = pool.acquire();
        buf.resize(pool.buffer_capacity(), 0);

        let n = tokio::select! {
            _ = shutdown.changed() => {
                debug!("device reader: shutdown");
                return Ok(());
            }
            read = device.read(&mut buf) => read?,
        };
        if n == 0 {
            debug!("device reader: EOF");
            return Ok(());
        }
        buf.truncate(n);
        stats.record_packet_read();

        let packet = match Packet::parse(buf) {
            Ok(packet) => packet,
            Err(err) => {
                stats.record_parse_error();
                warn!(%err, "dropping malformed frame");
                continue;
            }
        };

        tap.observe_packet(&packet);

        if packet.is_tcp() {
            if tcp_tx.send(packet).await.is_err() {
                return Ok(());
            }
        } else if packet.is_udp() {
            if udp_tx.send(packet).await.is_err() {
                return Ok(());
            }
        } else {
            let err = RelayError::UnsupportedProtocol(packet.ipv4.protocol.number());
            trace!(%err, "dropping frame");
            stats.record_dropped_frame();
            pool.release(packet.into_buffer());
        }
    }
}

/// Drain device-bound frames onto the device and recycle their buffers.
pub async fn device_writer<W>(
    mut device: W,
    pool: Arc<BufferPool>,
    mut frames: mpsc::Receiver<BytesMut>,
    stats: Arc<RelayStats>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => {
                debug!("device writer: shutdown");
                return Ok(());
            }
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => return Ok(()),
            },
        };
        device.write_all(&frame).await?;
        device.flush().await?;
        stats.record_packet_written();
        pool.release(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ResponseTemplate, TcpFlags};
    use std::net::Ipv4Addr;
    use tokio::io::duplex;

    fn stack() -> (Arc<BufferPool>, Arc<RelayStats>, watch::Receiver<bool>, watch::Sender<bool>) {
        let pool = Arc::new(BufferPool::new(2048, 8));
        let stats = Arc::new(RelayStats::new());
        let (tx, rx) = watch::channel(false);
        (pool, stats, rx, tx)
    }

    fn client() -> ResponseTemplate {
        ResponseTemplate::new(
            Ipv4Addr::new(10, 0, 0, 2),
            5555,
            Ipv4Addr::new(93, 184, 216, 34),
            80,
        )
    }

    #[tokio::test]
    async fn reader_routes_by_protocol() {
        let (pool, stats, shutdown, _signal) = stack();
        let (mut near, far) = duplex(4096);
        let (tcp_tx, mut tcp_rx) = mpsc::channel(4);
        let (udp_tx, mut udp_rx) = mpsc::channel(4);

        let reader = tokio::spawn(device_reader(
            far,
            pool,
            CaptureTap::disabled(),
            tcp_tx,
            udp_tx,
            stats.clone(),
            shutdown,
        ));

        let syn = client().tcp_segment(TcpFlags { syn: true, ..Default::default() }, 100, 0, &[]);
        near.write_all(&syn).await.unwrap();
        let packet = tcp_rx.recv().await.unwrap();
        assert!(packet.is_tcp());
        assert_eq!(packet.tcp().unwrap().seq, 100);

        let dgram = client().udp_datagram(b"ping");
        near.write_all(&dgram).await.unwrap();
        let packet = udp_rx.recv().await.unwrap();
        assert!(packet.is_udp());
        assert_eq!(packet.payload(), b"ping");

        drop(near);
        reader.await.unwrap().unwrap();
        assert_eq!(stats.snapshot().packets_read, 2);
    }

    #[tokio::test]
    async fn reader_survives_malformed_and_unknown_frames() {
        let (pool, stats, shutdown, _signal) = stack();
        let (mut near, far) = duplex(4096);
        let (tcp_tx, mut tcp_rx) = mpsc::channel(4);
        let (udp_tx, _udp_rx) = mpsc::channel(4);

        let reader = tokio::spawn(device_reader(
            far,
            pool.clone(),
            CaptureTap::disabled(),
            tcp_tx,
            udp_tx,
            stats.clone(),
            shutdown,
        ));

        // Truncated garbage, then a GRE frame, then a valid TCP frame.
        near.write_all(&[0x45, 0x00, 0x00]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let mut gre = client().tcp_segment(TcpFlags::ack_only(), 1, 1, &[]);
        gre[9] = 47;
        near.write_all(&gre).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let valid = client().tcp_segment(TcpFlags::ack_only(), 2, 1, &[]);
        near.write_all(&valid).await.unwrap();

        let packet = tcp_rx.recv().await.unwrap();
        assert_eq!(packet.tcp().unwrap().seq, 2);

        drop(near);
        reader.await.unwrap().unwrap();
        let snap = stats.snapshot();
        assert_eq!(snap.parse_errors, 1);
        assert_eq!(snap.dropped_frames, 1);
    }

    #[tokio::test]
    async fn writer_flushes_frames_and_recycles_buffers() {
        let (pool, stats, shutdown, _signal) = stack();
        let (far, mut near) = duplex(4096);
        let (frame_tx, frame_rx) = mpsc::channel(4);

        let writer = tokio::spawn(device_writer(
            far,
            pool.clone(),
            frame_rx,
            stats.clone(),
            shutdown,
        ));

        let mut frame = pool.acquire();
        client().write_udp_datagram(&mut frame, b"pong");
        let expected = frame.clone();
        frame_tx.send(frame).await.unwrap();

        let mut out = vec![0u8; expected.len()];
        near.read_exact(&mut out).await.unwrap();
        assert_eq!(&out[..], &expected[..]);

        drop(frame_tx);
        writer.await.unwrap().unwrap();
        assert_eq!(stats.snapshot().packets_written, 1);
        assert_eq!(pool.pooled(), 1);
    }

    #[tokio::test]
    async fn shutdown_signal_stops_both_loops() {
        let (pool, stats, shutdown, signal) = stack();
        let (_near, far) = duplex(64);
        let (tcp_tx, _tcp_rx) = mpsc::channel(1);
        let (udp_tx, _udp_rx) = mpsc::channel(1);

        let reader = tokio::spawn(device_reader(
            far,
            pool,
            CaptureTap::disabled(),
            tcp_tx,
            udp_tx,
            stats,
            shutdown,
        ));
        signal.send(true).unwrap();
        reader.await.unwrap().unwrap();
    }
}
