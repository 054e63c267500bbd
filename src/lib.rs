//! tunsniff: user-space tun-to-socket relay engine with packet capture.
//!
//! Bridges a virtual network interface to real OS sockets: IPv4/TCP/UDP
//! frames read from the device are relayed through per-flow upstream
//! sockets, responses are re-stamped as device-bound frames, and every
//! observed packet can be mirrored to a capture sink with pcap export.
//!
//! ```text
//!              +-------------------- Relay session --------------------+
//!              |                                                       |
//!  device ---> | reader --+--> tcp queue --> TcpRelay <--> TcpStream   | ---> network
//!   (tun)      |          |                  (per-flow TCB)            |
//!              |          +--> udp queue --> UdpRelay <--> UdpSocket   |
//!              |          |                                            |
//!              |          +--> CaptureTap --> records / PacketStore    |
//!              |                                                       |
//!  device <--- | writer <------- frame queue <------- relay halves     | <--- network
//!              +-------------------------------------------------------+
//! ```
//!
//! Attach the engine to any byte-oriented duplex device:
//!
//! ```no_run
//! use tunsniff::{Relay, RelayConfig};
//!
//! # async fn run(tun_read: tokio::io::ReadHalf<tokio::io::DuplexStream>,
//! #              tun_write: tokio::io::WriteHalf<tokio::io::DuplexStream>) {
//! let handle = Relay::new(RelayConfig::default()).spawn(tun_read, tun_write);
//! // ... traffic flows ...
//! handle.shutdown().await;
//! # }
//! ```

pub mod capture;
pub mod device;
pub mod error;
pub mod packet;
pub mod pool;
pub mod relay;
pub mod table;
pub mod tcp;
pub mod udp;

pub use capture::{write_pcap, CaptureRecord, CaptureTap, PacketStore, RawPacket};
pub use error::{RelayError, Result};
pub use packet::{Ipv4Header, Packet, Protocol, ResponseTemplate, TcpFlags, TcpHeader, UdpHeader};
pub use pool::BufferPool;
pub use relay::{Relay, RelayConfig, RelayHandle, RelayStats, StatsSnapshot};
pub use table::{ConnectionTable, FlowKey, Tcb, TcbState};
pub use tcp::TcpRelay;
pub use udp::UdpRelay;

pub mod prelude {
    pub use crate::capture::{CaptureRecord, PacketStore};
    pub use crate::error::{RelayError, Result};
    pub use crate::packet::{Packet, Protocol, TcpFlags};
    pub use crate::relay::{Relay, RelayConfig, RelayHandle};
    pub use crate::table::{FlowKey, TcbState};
}
