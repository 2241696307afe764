use bytes::{Buf, Bytes};

use super::datatypes::{u24, ReadBuf, WriteBuf, U24_MAX};
use super::message::MessageError;
use super::DATAGRAM_FLAG_VALID;

const FLAG_FRAGMENTED: u8 = 0x10;

/// Frame reliability. The discriminant is the on-wire value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reliability {
    Unreliable = 0,
    UnreliableSequenced = 1,
    Reliable = 2,
    ReliableOrdered = 3,
    ReliableSequenced = 4,
    UnreliableAckReceipt = 5,
    ReliableAckReceipt = 6,
    ReliableOrderedAckReceipt = 7,
}

impl Reliability {
    /// Reliabilities carrying a 24-bit reliable message index.
    pub fn is_reliable(&self) -> bool {
        matches!(
            self,
            Self::Reliable
                | Self::ReliableOrdered
                | Self::ReliableSequenced
                | Self::ReliableAckReceipt
                | Self::ReliableOrderedAckReceipt
        )
    }

    /// Reliabilities carrying a 24-bit sequence index.
    pub fn is_sequenced(&self) -> bool {
        matches!(self, Self::UnreliableSequenced | Self::ReliableSequenced)
    }

    /// Reliabilities carrying a 24-bit order index plus channel byte.
    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            Self::UnreliableSequenced
                | Self::ReliableOrdered
                | Self::ReliableSequenced
                | Self::ReliableOrderedAckReceipt
        )
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Unreliable),
            0x01 => Some(Self::UnreliableSequenced),
            0x02 => Some(Self::Reliable),
            0x03 => Some(Self::ReliableOrdered),
            0x04 => Some(Self::ReliableSequenced),
            0x05 => Some(Self::UnreliableAckReceipt),
            0x06 => Some(Self::ReliableAckReceipt),
            0x07 => Some(Self::ReliableOrderedAckReceipt),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Split (fragment) information carried by a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitInfo {
    pub count: u32,
    pub id: u16,
    pub index: u32,
}

/// One encapsulated packet inside a datagram.
#[derive(Clone, Debug)]
pub struct Frame {
    pub reliability: Reliability,

    /// Only if reliable
    pub message_index: u24,
    /// Only if sequenced
    pub sequence_index: u24,
    /// Only if ordered
    pub order_index: u24,
    /// Only if ordered
    pub order_channel: u8,
    pub split: Option<SplitInfo>,

    pub body: Bytes,
}

impl Frame {
    pub fn serialize(&self, buf: &mut WriteBuf) -> Result<(), MessageError> {
        let mut header = self.reliability.to_u8() << 5;
        if self.split.is_some() {
            header |= FLAG_FRAGMENTED;
        }
        buf.write_u8(header)?;
        buf.write_u16((self.body.len() << 3) as u16)?;
        if self.reliability.is_reliable() {
            buf.write_u24(self.message_index)?;
        }
        if self.reliability.is_sequenced() {
            buf.write_u24(self.sequence_index)?;
        }
        if self.reliability.is_ordered() {
            buf.write_u24(self.order_index)?;
            buf.write_u8(self.order_channel)?;
        }
        if let Some(split) = self.split.as_ref() {
            buf.write_u32(split.count)?;
            buf.write_u16(split.id)?;
            buf.write_u32(split.index)?;
        }
        buf.0.extend_from_slice(&self.body);
        Ok(())
    }

    pub fn deserialize(buf: &mut ReadBuf) -> Result<Self, MessageError> {
        let header = buf.read_u8()?;
        let fragmented = (header & FLAG_FRAGMENTED) != 0;
        let reliability_id = (header & 0xE0) >> 5;
        let reliability = Reliability::from_u8(reliability_id)
            .ok_or(MessageError::UnknownReliability(reliability_id))?;
        // bit length, rounded up to whole bytes; zero is legal
        let body_len = (buf.read_u16()? as usize).div_ceil(8);

        let message_index = if reliability.is_reliable() {
            buf.read_u24()?
        } else {
            0
        };
        let sequence_index = if reliability.is_sequenced() {
            buf.read_u24()?
        } else {
            0
        };
        let (order_index, order_channel) = if reliability.is_ordered() {
            (buf.read_u24()?, buf.read_u8()?)
        } else {
            (0, 0)
        };

        let split = if fragmented {
            Some(SplitInfo {
                count: buf.read_u32()?,
                id: buf.read_u16()?,
                index: buf.read_u32()?,
            })
        } else {
            None
        };

        if buf.remaining() < body_len {
            return Err(MessageError::InvalidFrame);
        }
        let body = buf.0.split_to(body_len);

        Ok(Self {
            reliability,
            message_index,
            sequence_index,
            order_index,
            order_channel,
            split,
            body,
        })
    }
}

/// A parsed datagram header plus an iterator over its frames.
pub struct Datagram {
    pub flags: u8,
    pub sequence: u24,
    frames: FrameIter,
}

/// Iterates the encapsulated packets of a datagram. A malformed frame is
/// yielded once as an error, after which iteration stops and the rest of
/// the datagram is discarded.
pub struct FrameIter {
    buf: ReadBuf,
    poisoned: bool,
}

impl Datagram {
    /// Parses the datagram header. Frames are decoded lazily through the
    /// returned iterator.
    pub fn parse(data: Bytes) -> Result<Self, MessageError> {
        let mut buf = ReadBuf::new(data);
        let flags = buf.read_u8()?;
        if flags & DATAGRAM_FLAG_VALID == 0 {
            return Err(MessageError::InvalidFrame);
        }
        let sequence = buf.read_u24()?;
        Ok(Self {
            flags,
            sequence,
            frames: FrameIter {
                buf,
                poisoned: false,
            },
        })
    }

    pub fn frames(self) -> FrameIter {
        self.frames
    }
}

impl Iterator for FrameIter {
    type Item = Result<Frame, MessageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned || !self.buf.0.has_remaining() {
            return None;
        }
        match Frame::deserialize(&mut self.buf) {
            Ok(frame) => Some(Ok(frame)),
            Err(err) => {
                self.poisoned = true;
                Some(Err(err))
            }
        }
    }
}

/// Returns whether the leading byte marks a reliability datagram.
/// Acknowledgement packets also carry the valid bit; use
/// [`is_reliable_frame`] to exclude them.
#[inline]
pub fn is_datagram(first_byte: u8) -> bool {
    first_byte & DATAGRAM_FLAG_VALID != 0
}

/// Returns whether the leading byte marks a frame-carrying datagram
/// (top nibble 0x8), excluding ACK (0xC0) and NACK (0xA0) packets.
#[inline]
pub fn is_reliable_frame(first_byte: u8) -> bool {
    first_byte & 0xF0 == 0x80
}

/// Synthesizes a datagram carrying a single reliable-ordered frame.
///
/// Used to inject packets into an established connection; the caller is
/// responsible for providing indices past anything the peer has observed.
pub fn build_reliable_ordered(
    sequence: u24,
    message_index: u24,
    order_index: u24,
    payload: &[u8],
) -> Vec<u8> {
    let frame = Frame {
        reliability: Reliability::ReliableOrdered,
        message_index: message_index & U24_MAX,
        sequence_index: 0,
        order_index: order_index & U24_MAX,
        order_channel: 0,
        split: None,
        body: Bytes::copy_from_slice(payload),
    };
    let mut buf = WriteBuf::new();
    // infallible: WriteBuf never errors on plain writes
    let _ = buf.write_u8(DATAGRAM_FLAG_VALID);
    let _ = buf.write_u24(sequence & U24_MAX);
    let _ = frame.serialize(&mut buf);
    buf.0.to_vec()
}

/// Encodes an acknowledgement packet for a single datagram sequence.
pub fn build_ack(sequence: u24) -> Vec<u8> {
    let mut buf = WriteBuf::new();
    let _ = buf.write_u8(super::ACK_HEADER);
    let _ = buf.write_u16(1);
    let _ = buf.write_u8(1); // single-sequence record
    let _ = buf.write_u24(sequence & U24_MAX);
    buf.0.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) -> Frame {
        let mut buf = WriteBuf::new();
        let _ = buf.write_u8(DATAGRAM_FLAG_VALID);
        let _ = buf.write_u24(7);
        frame.serialize(&mut buf).unwrap();
        let datagram = Datagram::parse(buf.0.freeze()).unwrap();
        assert_eq!(datagram.sequence, 7);
        let mut frames = datagram.frames();
        let parsed = frames.next().unwrap().unwrap();
        assert!(frames.next().is_none());
        parsed
    }

    #[test]
    fn reliable_ordered_round_trip() {
        let frame = Frame {
            reliability: Reliability::ReliableOrdered,
            message_index: 10,
            sequence_index: 0,
            order_index: 5,
            order_channel: 0,
            split: None,
            body: Bytes::from_static(&[0xFE, 0x01, 0x02, 0x03]),
        };
        let parsed = round_trip(frame);
        assert_eq!(parsed.reliability, Reliability::ReliableOrdered);
        assert_eq!(parsed.message_index, 10);
        assert_eq!(parsed.order_index, 5);
        assert_eq!(&parsed.body[..], &[0xFE, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn fragmented_frame_round_trip() {
        let frame = Frame {
            reliability: Reliability::Reliable,
            message_index: 3,
            sequence_index: 0,
            order_index: 0,
            order_channel: 0,
            split: Some(SplitInfo {
                count: 2,
                id: 7,
                index: 1,
            }),
            body: Bytes::from_static(b"WORLD"),
        };
        let parsed = round_trip(frame);
        assert_eq!(
            parsed.split,
            Some(SplitInfo {
                count: 2,
                id: 7,
                index: 1
            })
        );
        assert_eq!(&parsed.body[..], b"WORLD");
    }

    #[test]
    fn zero_length_body_is_legal() {
        let frame = Frame {
            reliability: Reliability::Unreliable,
            message_index: 0,
            sequence_index: 0,
            order_index: 0,
            order_channel: 0,
            split: None,
            body: Bytes::new(),
        };
        let parsed = round_trip(frame);
        assert!(parsed.body.is_empty());
    }

    #[test]
    fn malformed_frame_stops_iteration() {
        // valid header, then a frame whose declared bit length exceeds the data
        let data = Bytes::from_static(&[0x84, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF]);
        let datagram = Datagram::parse(data).unwrap();
        let mut frames = datagram.frames();
        assert!(frames.next().unwrap().is_err());
        assert!(frames.next().is_none());
    }

    #[test]
    fn build_reliable_ordered_parses_back() {
        let data = build_reliable_ordered(1, 2, 3, &[0xFE, 0xAA]);
        let datagram = Datagram::parse(Bytes::from(data)).unwrap();
        assert_eq!(datagram.sequence, 1);
        let frame = datagram.frames().next().unwrap().unwrap();
        assert_eq!(frame.reliability, Reliability::ReliableOrdered);
        assert_eq!(frame.message_index, 2);
        assert_eq!(frame.order_index, 3);
        assert_eq!(&frame.body[..], &[0xFE, 0xAA]);
    }
}
