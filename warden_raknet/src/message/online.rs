//! Messages exchanged inside frames once a connection is established.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::datatypes::{ReadBuf, WriteBuf};

use super::{write_header, Message, MessageError, RaknetMessage};

/// Number of system addresses in an accept/new-incoming message.
const SYSTEM_ADDRESS_COUNT: usize = 10;

fn null_address() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}

#[derive(Clone, Debug)]
pub struct MessageConnectedPing {
    pub timestamp: i64,
}

#[derive(Clone, Debug)]
pub struct MessageConnectedPong {
    pub ping_timestamp: i64,
    pub pong_timestamp: i64,
}

#[derive(Clone, Debug)]
pub struct MessageConnectionRequest {
    pub client_uuid: i64,
    pub timestamp: i64,
    pub use_security: bool,
}

#[derive(Clone, Debug)]
pub struct MessageConnectionRequestAccepted {
    pub client_address: SocketAddr,
    pub system_index: u16,
    pub request_timestamp: i64,
    pub accepted_timestamp: i64,
}

#[derive(Clone, Debug)]
pub struct MessageNewIncomingConnection {
    pub server_address: SocketAddr,
    pub request_timestamp: i64,
    pub accepted_timestamp: i64,
}

impl Message for MessageConnectedPing {
    fn serialize(&self, buf: &mut WriteBuf) -> Result<(), MessageError> {
        write_header(buf, RaknetMessage::ConnectedPing)?;
        buf.write_i64(self.timestamp)?;
        Ok(())
    }

    fn deserialize(buf: &mut ReadBuf) -> Result<Self, MessageError> {
        Ok(Self {
            timestamp: buf.read_i64()?,
        })
    }
}

impl Message for MessageConnectedPong {
    fn serialize(&self, buf: &mut WriteBuf) -> Result<(), MessageError> {
        write_header(buf, RaknetMessage::ConnectedPong)?;
        buf.write_i64(self.ping_timestamp)?;
        buf.write_i64(self.pong_timestamp)?;
        Ok(())
    }

    fn deserialize(buf: &mut ReadBuf) -> Result<Self, MessageError> {
        Ok(Self {
            ping_timestamp: buf.read_i64()?,
            pong_timestamp: buf.read_i64()?,
        })
    }
}

impl Message for MessageConnectionRequest {
    fn serialize(&self, buf: &mut WriteBuf) -> Result<(), MessageError> {
        write_header(buf, RaknetMessage::ConnectionRequest)?;
        buf.write_i64(self.client_uuid)?;
        buf.write_i64(self.timestamp)?;
        buf.write_bool(self.use_security)?;
        Ok(())
    }

    fn deserialize(buf: &mut ReadBuf) -> Result<Self, MessageError> {
        Ok(Self {
            client_uuid: buf.read_i64()?,
            timestamp: buf.read_i64()?,
            use_security: buf.read_bool()?,
        })
    }
}

impl Message for MessageConnectionRequestAccepted {
    fn serialize(&self, buf: &mut WriteBuf) -> Result<(), MessageError> {
        write_header(buf, RaknetMessage::ConnectionRequestAccepted)?;
        buf.write_address(self.client_address)?;
        buf.write_u16(self.system_index)?;
        for _ in 0..SYSTEM_ADDRESS_COUNT {
            buf.write_address(null_address())?;
        }
        buf.write_i64(self.request_timestamp)?;
        buf.write_i64(self.accepted_timestamp)?;
        Ok(())
    }

    fn deserialize(buf: &mut ReadBuf) -> Result<Self, MessageError> {
        let client_address = buf.read_address()?;
        let system_index = buf.read_u16()?;
        for _ in 0..SYSTEM_ADDRESS_COUNT {
            // some implementations pad fewer addresses; stop once only the
            // two trailing timestamps remain
            if buf.remaining() <= 16 {
                break;
            }
            buf.read_address()?;
        }
        Ok(Self {
            client_address,
            system_index,
            request_timestamp: buf.read_i64()?,
            accepted_timestamp: buf.read_i64()?,
        })
    }
}

impl Message for MessageNewIncomingConnection {
    fn serialize(&self, buf: &mut WriteBuf) -> Result<(), MessageError> {
        write_header(buf, RaknetMessage::NewIncomingConnection)?;
        buf.write_address(self.server_address)?;
        for _ in 0..SYSTEM_ADDRESS_COUNT {
            buf.write_address(null_address())?;
        }
        buf.write_i64(self.request_timestamp)?;
        buf.write_i64(self.accepted_timestamp)?;
        Ok(())
    }

    fn deserialize(buf: &mut ReadBuf) -> Result<Self, MessageError> {
        let server_address = buf.read_address()?;
        for _ in 0..SYSTEM_ADDRESS_COUNT {
            if buf.remaining() <= 16 {
                break;
            }
            buf.read_address()?;
        }
        Ok(Self {
            server_address,
            request_timestamp: buf.read_i64()?,
            accepted_timestamp: buf.read_i64()?,
        })
    }
}
