//! # Transport Error Types
//!
//! Send-side errors are returned to the caller. Receive-side errors are
//! returned by [`crate::PacketTransport::receive_frame`] and, when frames
//! arrive through the event channel, logged and counted by `poll`.

use thiserror::Error;

use crate::frame::MacAddress;

/// Errors reported by a radio driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// The driver has no room for another frame right now.
    #[error("radio driver busy")]
    Busy,

    /// Unicast to an address that was never registered as a peer.
    #[error("peer {0} is not registered with the radio")]
    PeerNotRegistered(MacAddress),

    /// The driver's own peer registry is full.
    #[error("radio peer registry full")]
    PeerTableFull,

    /// Raw driver status code.
    #[error("radio driver failure: code {0}")]
    Driver(i32),
}

/// Errors that can occur in the transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Storage for the whole fragment cluster could not be reserved.
    /// Nothing was queued.
    #[error("allocation failure: could not reserve {needed_frames} frames")]
    AllocationFailure {
        /// Frames the cluster would have needed.
        needed_frames: usize,
    },

    /// Payload needs more fragments than the header can count.
    #[error("payload too large: {len} bytes, limit {max}")]
    PayloadTooLarge {
        /// Payload length.
        len: usize,
        /// Largest payload that fits in a cluster.
        max: usize,
    },

    /// Received frame is shorter than a header.
    #[error("frame too short: {len} bytes")]
    FrameTooShort {
        /// Received length.
        len: usize,
    },

    /// Header length field disagrees with what was received.
    #[error("frame length mismatch: header says {declared}, received {actual}")]
    FrameLengthMismatch {
        /// Payload length announced in the header.
        declared: usize,
        /// Payload length actually received.
        actual: usize,
    },

    /// Fragment index/count pair that cannot exist.
    #[error("malformed header: fragment {index} of {count}")]
    MalformedHeader {
        /// Fragment index.
        index: u8,
        /// Fragment count.
        count: u8,
    },

    /// Payload type byte outside the registry.
    #[error("unknown payload type: {0}")]
    UnknownPayloadType(u8),

    /// Fragment arrived out of order; the partial message was discarded.
    #[error("sequence violation from {peer}: expected fragment {expected}, got {received}")]
    SequenceViolation {
        /// Sending peer.
        peer: MacAddress,
        /// Next index the buffer was waiting for.
        expected: u8,
        /// Index that actually arrived.
        received: u8,
    },

    /// Mid-cluster fragment with no buffer to append to.
    #[error("orphan fragment {index} from {peer}")]
    OrphanFragment {
        /// Sending peer.
        peer: MacAddress,
        /// Fragment index.
        index: u8,
    },

    /// Every peer slot is held by a peer we are talking to, so a
    /// multi-fragment cluster from a new sender cannot be tracked.
    #[error("no peer slot free for {peer}")]
    NoPeerSlot {
        /// Sending peer.
        peer: MacAddress,
    },

    /// The radio driver rejected an operation.
    #[error("radio error: {0}")]
    Radio(#[from] RadioError),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
