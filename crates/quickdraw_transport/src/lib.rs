//! # Quickdraw Transport
//!
//! Datagram transport for a short-range radio whose physical frame tops out
//! at 250 bytes and which can only address a small number of registered peers.
//!
//! ## Architecture
//!
//! - **Frame**: 5 byte header prepended to every radio frame
//! - **Transport**: fragmentation, single FIFO send queue, bounded retry
//! - **Peers**: bounded LRU table mirroring the radio's peer registry, holding
//!   one reassembly buffer per source
//! - **Radio**: the driver seam, plus the event channel that carries
//!   completions and receptions out of interrupt context
//! - **Simulation**: an in-process lossy medium for tests and benches
//!
//! ## Execution Model
//!
//! ```text
//! RADIO / ISR CONTEXT              APPLICATION TICK
//!   |                                 |
//!   |-- SendComplete{ok} ---chan----->| poll(): free head / retry / drop
//!   |-- Received{bytes} ----chan----->| poll(): reassemble -> handler
//!   |                                 |
//!   |<------------- Radio::send ------| send(): fragment + enqueue
//! ```
//!
//! Nothing here blocks. Delivery is only guaranteed within a single message:
//! a lost fragment drops the whole message at the receiver.
//!
//! ## Example
//!
//! ```rust,ignore
//! use quickdraw_transport::{PacketTransport, PayloadType, TransportConfig};
//!
//! let mut transport = PacketTransport::new(radio, events, TransportConfig::default());
//! transport.set_handler(PayloadType::QuickdrawCommand, Box::new(|from, bytes| {
//!     tracing::info!("{} bytes from {}", bytes.len(), from);
//! }));
//! transport.send(peer, PayloadType::QuickdrawCommand, &payload)?;
//! transport.poll(now_ms);
//! ```

pub mod error;
pub mod frame;
pub mod peer;
pub mod radio;
pub mod simulation;
pub mod transport;

// Re-exports for convenience
pub use error::{RadioError, TransportError, TransportResult};
pub use frame::{FrameHeader, MacAddress, PayloadType};
pub use peer::{PeerEntry, PeerTable};
pub use radio::{event_channel, Radio, RadioEvent, RadioEventSink};
pub use simulation::{AirStats, LinkConditions, SimulatedAir, SimulatedRadio};
pub use transport::{PacketTransport, PayloadHandler, TransportConfig, TransportStats};

/// Largest frame the radio will put on the air, header included.
pub const MAX_FRAME_LEN: usize = 250;

/// Payload bytes left in a frame once the header is written.
pub const MAX_FRAGMENT_PAYLOAD: usize = MAX_FRAME_LEN - FrameHeader::SIZE;

/// Fragment indices and counts are single bytes on the wire.
pub const MAX_FRAGMENTS: usize = u8::MAX as usize;

/// Retries of a failed fragment before it is dropped.
pub const DEFAULT_MAX_RETRIES: u8 = 5;

/// Peer registry ceiling of the radio hardware.
pub const DEFAULT_PEER_CAPACITY: usize = 20;
