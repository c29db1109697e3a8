//! # Frame Definitions
//!
//! Every radio frame starts with a fixed 5 byte header:
//!
//! ```text
//! +-------+-------+-----------+------+------------------------+
//! | index | count | length LE | type | payload (<= 245 bytes) |
//! |  u8   |  u8   |    u16    |  u8  |                        |
//! +-------+-------+-----------+------+------------------------+
//! ```
//!
//! The header is a `Pod` struct of byte fields so it can be cast straight
//! to and from the wire without padding or alignment concerns.

use std::fmt;

use bytemuck::{Pod, Zeroable};

use crate::error::TransportError;

/// Six byte radio hardware address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Address every listening device accepts.
    pub const BROADCAST: Self = Self([0xFF; 6]);

    /// All-zero address, used for "no peer known yet".
    pub const UNSPECIFIED: Self = Self([0; 6]);

    /// Creates an address from raw bytes.
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Returns true for the broadcast address.
    #[inline]
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Returns true for the all-zero address.
    #[inline]
    #[must_use]
    pub fn is_unspecified(&self) -> bool {
        *self == Self::UNSPECIFIED
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// What a reassembled message carries. One handler per type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    /// Player profile exchange.
    PlayerInfo = 0,
    /// Duel command packets.
    QuickdrawCommand = 1,
    /// Free-form debug traffic.
    Debug = 2,
}

impl PayloadType {
    /// Number of payload types.
    pub const COUNT: usize = 3;

    /// Dense index for handler tables.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for PayloadType {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::PlayerInfo),
            1 => Ok(Self::QuickdrawCommand),
            2 => Ok(Self::Debug),
            other => Err(TransportError::UnknownPayloadType(other)),
        }
    }
}

/// Frame header - present in every radio frame.
///
/// Total size: 5 bytes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FrameHeader {
    /// Position of this fragment within its cluster.
    pub fragment_index: u8,
    /// Fragments in the cluster.
    pub fragment_count: u8,
    /// Payload bytes in this frame, little-endian.
    frame_length: [u8; 2],
    /// Raw [`PayloadType`] byte.
    pub payload_type: u8,
}

impl FrameHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 5;

    /// Creates a new frame header.
    #[inline]
    #[must_use]
    pub const fn new(
        fragment_index: u8,
        fragment_count: u8,
        frame_length: u16,
        payload_type: PayloadType,
    ) -> Self {
        Self {
            fragment_index,
            fragment_count,
            frame_length: frame_length.to_le_bytes(),
            payload_type: payload_type as u8,
        }
    }

    /// Payload bytes carried by this frame.
    #[inline]
    #[must_use]
    pub const fn frame_length(&self) -> u16 {
        u16::from_le_bytes(self.frame_length)
    }

    /// True for the last fragment of a cluster.
    #[inline]
    #[must_use]
    pub const fn is_last(&self) -> bool {
        self.fragment_index.wrapping_add(1) == self.fragment_count
    }

    /// Header bytes as they go on the air.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Reads a header from the front of a received frame.
    ///
    /// Returns `None` if the frame is shorter than a header.
    #[must_use]
    pub fn parse(frame: &[u8]) -> Option<Self> {
        frame
            .get(..Self::SIZE)
            .map(bytemuck::pod_read_unaligned::<Self>)
    }
}
