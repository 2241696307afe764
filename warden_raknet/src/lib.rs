//! Partial Raknet protocol implementation tailored to proxying.
//!
//! Covers the offline (unconnected) messages, datagram/frame codec,
//! split-packet reassembly and a minimal session layer. Reliability is
//! acknowledgement-only; there is no retransmission queue.

pub mod bedrock;
pub mod conn;
pub mod datatypes;
pub mod frame;
pub mod message;
pub mod split;

/// Offline message marker.
pub(crate) const MAGIC: [u8; 16] = [
    0x00, 0xFF, 0xFF, 0x00, 0xFE, 0xFE, 0xFE, 0xFE, 0xFD, 0xFD, 0xFD, 0xFD, 0x12, 0x34, 0x56, 0x78,
];

/// Leading byte of a game packet wrapped in a Raknet frame.
pub const GAME_PACKET_HEADER: u8 = 0xFE;

/// Flag bit set on every valid online datagram.
pub const DATAGRAM_FLAG_VALID: u8 = 0x80;
/// Flag bit indicating acknowledgement framing (B-and-AS).
pub const DATAGRAM_FLAG_CONTINUOUS: u8 = 0x04;
/// Header of an acknowledgement packet.
pub const ACK_HEADER: u8 = 0xC0;
/// Header of a negative acknowledgement packet.
pub const NACK_HEADER: u8 = 0xA0;

/// Supported Raknet protocol versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolVersion {
    Unsupported(u8),
    V10,
    V11,
}

impl ProtocolVersion {
    pub fn from_u8(version: u8) -> Self {
        match version {
            10 => Self::V10,
            11 => Self::V11,
            version => Self::Unsupported(version),
        }
    }

    pub fn to_u8(&self) -> u8 {
        match self {
            Self::Unsupported(version) => *version,
            Self::V10 => 10,
            Self::V11 => 11,
        }
    }
}
