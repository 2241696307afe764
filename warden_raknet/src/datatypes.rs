//! Byte-level cursors for the wire types Raknet and the game batch
//! format use: big-endian integers, 3-byte little-endian sequence
//! numbers, LEB128 varints, length-prefixed strings and the inverted
//! IPv4 address encoding.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::MAGIC;

/// Alias type for a u24 to make things clearer. Not an actual u24!
#[allow(non_camel_case_types)]
pub type u24 = u32;

/// Mask applied to any value stored in a 24-bit field.
pub const U24_MAX: u32 = 0x00FF_FFFF;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BufError {
    /// There is no more data to read
    NotEnoughData,
    /// Expected [`crate::MAGIC`] but didn't get it
    InvalidMagic,
    /// Invalid string encoding
    InvalidString,
    /// Invalid socket address
    InvalidAddress,
    /// Variable-length integer ran past its maximum width
    VarIntTooLong,
}

impl From<BufError> for anyhow::Error {
    fn from(value: BufError) -> Self {
        Self::msg(format!("{:?}", value))
    }
}

/// Read cursor over one received datagram.
#[derive(Clone, Debug)]
pub struct ReadBuf(pub Bytes);

impl ReadBuf {
    pub fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    pub fn remaining(&self) -> usize {
        self.0.remaining()
    }

    #[inline]
    fn ensure(&self, len: usize) -> Result<(), BufError> {
        if self.0.remaining() < len {
            Err(BufError::NotEnoughData)
        } else {
            Ok(())
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, BufError> {
        self.ensure(1)?;
        Ok(self.0.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool, BufError> {
        Ok(self.read_u8()? == 1)
    }

    pub fn read_u16(&mut self) -> Result<u16, BufError> {
        self.ensure(2)?;
        Ok(self.0.get_u16())
    }

    /// 3-byte little-endian, used for datagram and frame indices.
    pub fn read_u24(&mut self) -> Result<u24, BufError> {
        self.ensure(3)?;
        let mut bytes = [0u8; 4];
        self.0.copy_to_slice(&mut bytes[..3]);
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_u32(&mut self) -> Result<u32, BufError> {
        self.ensure(4)?;
        Ok(self.0.get_u32())
    }

    pub fn read_i32(&mut self) -> Result<i32, BufError> {
        self.ensure(4)?;
        Ok(self.0.get_i32())
    }

    pub fn read_i64(&mut self) -> Result<i64, BufError> {
        self.ensure(8)?;
        Ok(self.0.get_i64())
    }

    /// Unsigned LEB128, at most 5 bytes wide. The game batch format uses
    /// these for lengths and packet headers.
    pub fn read_var_u32(&mut self) -> Result<u32, BufError> {
        let mut value: u32 = 0;
        for shift in (0..35).step_by(7) {
            let byte = self.read_u8()?;
            value |= ((byte & 0x7F) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(BufError::VarIntTooLong)
    }

    /// u16-length-prefixed string.
    pub fn read_str(&mut self) -> Result<String, BufError> {
        let len = self.read_u16()? as usize;
        self.ensure(len)?;
        let mut bytes = vec![0u8; len];
        self.0.copy_to_slice(&mut bytes);
        String::from_utf8(bytes).map_err(|_| BufError::InvalidString)
    }

    pub fn read_magic(&mut self) -> Result<(), BufError> {
        self.ensure(MAGIC.len())?;
        let mut dest = [0u8; 16];
        self.0.copy_to_slice(&mut dest);
        if dest == MAGIC {
            Ok(())
        } else {
            Err(BufError::InvalidMagic)
        }
    }

    pub fn read_address(&mut self) -> Result<SocketAddr, BufError> {
        match self.read_u8()? {
            4 => {
                self.ensure(6)?;
                let mut octets = [0u8; 4];
                self.0.copy_to_slice(&mut octets);
                // v4 octets are stored bitwise inverted
                let ip = Ipv4Addr::new(!octets[0], !octets[1], !octets[2], !octets[3]);
                let port = self.0.get_u16();
                Ok(SocketAddr::new(IpAddr::V4(ip), port))
            }
            6 => {
                self.ensure(28)?;
                // family
                self.0.advance(2);
                let port = self.0.get_u16();
                // flow info
                self.0.advance(4);
                let mut octets = [0u8; 16];
                self.0.copy_to_slice(&mut octets);
                // scope id
                self.0.advance(4);
                Ok(SocketAddr::new(IpAddr::V6(octets.into()), port))
            }
            _ => Err(BufError::InvalidAddress),
        }
    }

    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), BufError> {
        self.ensure(buf.len())?;
        self.0.copy_to_slice(buf);
        Ok(())
    }
}

impl From<Vec<u8>> for ReadBuf {
    fn from(val: Vec<u8>) -> Self {
        ReadBuf(Bytes::from(val))
    }
}

impl From<&[u8]> for ReadBuf {
    fn from(val: &[u8]) -> Self {
        ReadBuf(Bytes::copy_from_slice(val))
    }
}

/// Write cursor for an outgoing datagram.
#[derive(Clone, Debug, Default)]
pub struct WriteBuf(pub BytesMut);

impl WriteBuf {
    pub fn new() -> Self {
        Self(BytesMut::new())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), BufError> {
        self.0.put_u8(value);
        Ok(())
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), BufError> {
        self.write_u8(value as u8)
    }

    pub fn write_u16(&mut self, value: u16) -> Result<(), BufError> {
        self.0.put_u16(value);
        Ok(())
    }

    pub fn write_u24(&mut self, value: u24) -> Result<(), BufError> {
        self.0.extend_from_slice(&value.to_le_bytes()[..3]);
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), BufError> {
        self.0.put_u32(value);
        Ok(())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<(), BufError> {
        self.0.put_i32(value);
        Ok(())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<(), BufError> {
        self.0.put_i64(value);
        Ok(())
    }

    pub fn write_var_u32(&mut self, mut value: u32) -> Result<(), BufError> {
        loop {
            let mut byte = (value & 0x7F) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.0.put_u8(byte);
            if value == 0 {
                return Ok(());
            }
        }
    }

    pub fn write_str(&mut self, value: &str) -> Result<(), BufError> {
        // doesn't need special encoding, seems to be limited to ascii anyway
        let bytes = value.as_bytes();
        self.0.put_u16(bytes.len() as u16);
        self.0.extend_from_slice(bytes);
        Ok(())
    }

    pub fn write_magic(&mut self) -> Result<(), BufError> {
        self.0.extend_from_slice(&MAGIC);
        Ok(())
    }

    pub fn write_address(&mut self, value: SocketAddr) -> Result<(), BufError> {
        match value {
            SocketAddr::V4(v4) => {
                self.0.put_u8(4);
                self.0.extend_from_slice(&v4.ip().octets().map(|b| !b));
                self.0.put_u16(v4.port());
            }
            SocketAddr::V6(v6) => {
                self.0.put_u8(6);
                self.0.put_u16(0);
                self.0.put_u16(v6.port());
                self.0.put_u32(0);
                self.0.extend_from_slice(&v6.ip().octets());
                self.0.put_u32(0);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_u32_round_trip() {
        for value in [0u32, 1, 127, 128, 300, 0x3FF, u32::MAX] {
            let mut buf = WriteBuf::new();
            buf.write_var_u32(value).unwrap();
            let mut read = ReadBuf::new(buf.0.freeze());
            assert_eq!(read.read_var_u32().unwrap(), value);
        }
    }

    #[test]
    fn var_u32_rejects_overlong() {
        let mut read = ReadBuf::from(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01][..]);
        assert_eq!(read.read_var_u32(), Err(BufError::VarIntTooLong));
    }

    #[test]
    fn u24_little_endian() {
        let mut buf = WriteBuf::new();
        buf.write_u24(0x0A0B0C).unwrap();
        assert_eq!(&buf.0[..], &[0x0C, 0x0B, 0x0A]);
        let mut read = ReadBuf::new(buf.0.freeze());
        assert_eq!(read.read_u24().unwrap(), 0x0A0B0C);
    }

    #[test]
    fn v4_address_octets_are_inverted() {
        let addr: SocketAddr = "192.168.1.7:19132".parse().unwrap();
        let mut buf = WriteBuf::new();
        buf.write_address(addr).unwrap();
        assert_eq!(buf.0[0], 4);
        assert_eq!(&buf.0[1..5], &[!192, !168, !1, !7]);
        let mut read = ReadBuf::new(buf.0.freeze());
        assert_eq!(read.read_address().unwrap(), addr);
    }

    #[test]
    fn v6_address_round_trip() {
        let addr: SocketAddr = "[2001:db8::1]:19133".parse().unwrap();
        let mut buf = WriteBuf::new();
        buf.write_address(addr).unwrap();
        let mut read = ReadBuf::new(buf.0.freeze());
        assert_eq!(read.read_address().unwrap(), addr);
    }

    #[test]
    fn short_reads_fail_cleanly() {
        let mut read = ReadBuf::from(&[0x01, 0x02][..]);
        assert_eq!(read.read_u32(), Err(BufError::NotEnoughData));
        // a declared string length past the end fails the same way
        let mut read = ReadBuf::from(&[0x00, 0x05, b'a'][..]);
        assert_eq!(read.read_str(), Err(BufError::NotEnoughData));
    }
}
