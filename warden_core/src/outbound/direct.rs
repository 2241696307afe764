use std::sync::Arc;

use raknet::conn::{PacketConn, UdpPacketConn};
use tokio::net::{TcpStream, UdpSocket};

use super::{OutboundConfig, OutboundStream, OutboundTransport};

/// The built-in no-tunnel transport: plain UDP sockets and TCP streams.
pub struct DirectTransport;

#[async_trait::async_trait]
impl OutboundTransport for DirectTransport {
    async fn dial_packet(
        &self,
        _node: &OutboundConfig,
        target: &str,
    ) -> anyhow::Result<Arc<dyn PacketConn>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(target).await?;
        Ok(Arc::new(UdpPacketConn(socket)))
    }

    async fn dial_stream(
        &self,
        _node: &OutboundConfig,
        target: &str,
    ) -> anyhow::Result<Box<dyn OutboundStream>> {
        let stream = TcpStream::connect(target).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
