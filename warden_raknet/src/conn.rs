//! Minimal Raknet session layer.
//!
//! Enough of the online protocol to terminate a client connection and to
//! dial a remote server: offline handshake, frame encoding/decoding with
//! split reassembly, acknowledgements and keep-alive pings. Incoming
//! frame bodies are delivered in arrival order, which is correct for the
//! single-order-channel traffic the game uses. There is no retransmission
//! queue; reliability is acknowledgement-only.

use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{net::UdpSocket, sync::mpsc, time::Instant};

use crate::{
    datatypes::{ReadBuf, WriteBuf, U24_MAX},
    frame::{self, Datagram, Frame, Reliability, SplitInfo},
    message::{
        Message, MessageConnectedPing, MessageConnectedPong, MessageConnectionRequest,
        MessageConnectionRequestAccepted, MessageNewIncomingConnection,
        MessageOpenConnectionReply1, MessageOpenConnectionReply2, MessageOpenConnectionRequest1,
        MessageOpenConnectionRequest2, RaknetMessage,
    },
    ProtocolVersion,
};

/// Datagram-oriented transport a Raknet session runs over.
///
/// Implemented by plain UDP sockets and by outbound tunnel providers.
#[async_trait::async_trait]
pub trait PacketConn: Send + Sync + std::fmt::Debug {
    async fn send(&self, data: &[u8]) -> io::Result<()>;

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// [`PacketConn`] over a connected UDP socket.
#[derive(Debug)]
pub struct UdpPacketConn(pub UdpSocket);

#[async_trait::async_trait]
impl PacketConn for UdpPacketConn {
    async fn send(&self, data: &[u8]) -> io::Result<()> {
        self.0.send(data).await.map(|_| ())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.recv(buf).await
    }
}

/// [`PacketConn`] addressing one peer through a shared, unconnected socket.
/// Receiving goes through the owner's dispatch loop, not through this handle.
#[derive(Debug)]
pub struct SharedUdpPeer {
    pub socket: Arc<UdpSocket>,
    pub peer: SocketAddr,
}

#[async_trait::async_trait]
impl PacketConn for SharedUdpPeer {
    async fn send(&self, data: &[u8]) -> io::Result<()> {
        self.socket.send_to(data, self.peer).await.map(|_| ())
    }

    async fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "shared socket peers are fed by the listener loop",
        ))
    }
}

/// Which side of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RakRole {
    Server,
    Client,
}

/// An established (or establishing) Raknet session.
pub struct RakConn {
    transport: Arc<dyn PacketConn>,
    role: RakRole,
    mtu: u16,
    started: Instant,

    send_seq: AtomicU32,
    send_message_index: AtomicU32,
    send_order_index: AtomicU32,
    send_split_id: AtomicU32,

    connected: AtomicBool,
    closed: AtomicBool,

    splits: Mutex<crate::split::SplitBuffers>,
    payload_tx: mpsc::Sender<Bytes>,
    payload_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    closed_notify: tokio::sync::Notify,
}

/// Frame overhead allowance when fragmenting: datagram header, frame
/// header, indices and split header.
const FRAGMENT_OVERHEAD: usize = 60;

impl RakConn {
    pub fn new(transport: Arc<dyn PacketConn>, role: RakRole, mtu: u16) -> Arc<Self> {
        let (payload_tx, payload_rx) = mpsc::channel(256);
        Arc::new(Self {
            transport,
            role,
            mtu,
            started: Instant::now(),
            send_seq: AtomicU32::new(0),
            send_message_index: AtomicU32::new(0),
            send_order_index: AtomicU32::new(0),
            send_split_id: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            splits: Mutex::new(crate::split::SplitBuffers::new()),
            payload_tx,
            payload_rx: tokio::sync::Mutex::new(payload_rx),
            closed_notify: tokio::sync::Notify::new(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn transport(&self) -> &Arc<dyn PacketConn> {
        &self.transport
    }

    fn timestamp_ms(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }

    /// Feeds one raw datagram received from the transport into the session.
    pub async fn handle_datagram(&self, data: Bytes) -> anyhow::Result<()> {
        if data.is_empty() || self.is_closed() {
            return Ok(());
        }
        let first = data[0];
        if !frame::is_datagram(first) {
            log::trace!("Ignoring non-datagram data with header {:02x}", first);
            return Ok(());
        }
        // acks and nacks carry the valid bit; there is no resend queue to
        // feed them into
        if !frame::is_reliable_frame(first) {
            return Ok(());
        }
        let datagram = Datagram::parse(data)?;
        self.transport
            .send(&frame::build_ack(datagram.sequence))
            .await?;
        for parsed in datagram.frames() {
            let parsed = match parsed {
                Ok(frame) => frame,
                Err(err) => {
                    log::debug!("Discarding malformed datagram tail: {:?}", err);
                    break;
                }
            };
            let body = match &parsed.split {
                Some(split) => {
                    let assembled = {
                        let mut splits = match self.splits.lock() {
                            Ok(splits) => splits,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        splits.insert(split, parsed.body.clone())
                    };
                    match assembled {
                        Some(body) => body,
                        None => continue,
                    }
                }
                None => parsed.body,
            };
            self.handle_frame_body(body).await?;
        }
        Ok(())
    }

    async fn handle_frame_body(&self, body: Bytes) -> anyhow::Result<()> {
        let Some(&first) = body.first() else {
            return Ok(());
        };
        if first == crate::GAME_PACKET_HEADER {
            // a full channel means the relay peer stalled; dropping is the
            // unreliable-transport-compatible behavior
            if self.payload_tx.try_send(body).is_err() {
                log::debug!("Session payload channel full, dropping game packet");
            }
            return Ok(());
        }
        match RaknetMessage::from_u8(first) {
            Some(RaknetMessage::ConnectedPing) => {
                let mut buf = ReadBuf::new(body.slice(1..));
                let ping = MessageConnectedPing::deserialize(&mut buf)?;
                let pong = MessageConnectedPong {
                    ping_timestamp: ping.timestamp,
                    pong_timestamp: self.timestamp_ms(),
                };
                self.send_message(&pong).await?;
            }
            Some(RaknetMessage::ConnectedPong) => {}
            Some(RaknetMessage::ConnectionRequest) if self.role == RakRole::Server => {
                let mut buf = ReadBuf::new(body.slice(1..));
                let request = MessageConnectionRequest::deserialize(&mut buf)?;
                let accepted = MessageConnectionRequestAccepted {
                    // clients don't validate the echoed address
                    client_address: SocketAddr::from(([0, 0, 0, 0], 0)),
                    system_index: 0,
                    request_timestamp: request.timestamp,
                    accepted_timestamp: self.timestamp_ms(),
                };
                self.send_message(&accepted).await?;
            }
            Some(RaknetMessage::ConnectionRequestAccepted) if self.role == RakRole::Client => {
                let mut buf = ReadBuf::new(body.slice(1..));
                let accepted = MessageConnectionRequestAccepted::deserialize(&mut buf)?;
                let incoming = MessageNewIncomingConnection {
                    server_address: accepted.client_address,
                    request_timestamp: accepted.request_timestamp,
                    accepted_timestamp: self.timestamp_ms(),
                };
                self.send_message(&incoming).await?;
                self.connected.store(true, Ordering::Release);
            }
            Some(RaknetMessage::NewIncomingConnection) if self.role == RakRole::Server => {
                self.connected.store(true, Ordering::Release);
            }
            Some(RaknetMessage::DisconnectNotification) => {
                self.mark_closed();
            }
            other => {
                log::trace!("Ignoring frame with message type {:?} ({:02x})", other, first);
            }
        }
        Ok(())
    }

    /// Awaits the next game packet payload. Returns [`None`] once the
    /// session is closed and drained.
    pub async fn next_payload(&self) -> Option<Bytes> {
        let mut rx = self.payload_rx.lock().await;
        loop {
            if self.is_closed() {
                return match rx.try_recv() {
                    Ok(payload) if !payload.is_empty() => Some(payload),
                    _ => None,
                };
            }
            tokio::select! {
                payload = rx.recv() => match payload {
                    Some(payload) if !payload.is_empty() => return Some(payload),
                    Some(_) => continue,
                    None => return None,
                },
                _ = self.closed_notify.notified() => continue,
            }
        }
    }

    async fn send_message<M: Message>(&self, message: &M) -> anyhow::Result<()> {
        let bytes = message.to_bytes()?;
        self.send_payload(&bytes).await
    }

    /// Sends a frame body, fragmenting it over the MTU as needed.
    pub async fn send_payload(&self, body: &[u8]) -> anyhow::Result<()> {
        if self.is_closed() {
            return Err(anyhow::anyhow!("session is closed"));
        }
        let order_index = self.next_index(&self.send_order_index);
        let budget = (self.mtu as usize).saturating_sub(FRAGMENT_OVERHEAD).max(64);
        if body.len() <= budget {
            let frame = Frame {
                reliability: Reliability::ReliableOrdered,
                message_index: self.next_index(&self.send_message_index),
                sequence_index: 0,
                order_index,
                order_channel: 0,
                split: None,
                body: Bytes::copy_from_slice(body),
            };
            return self.send_frame(frame).await;
        }
        let chunks: Vec<&[u8]> = body.chunks(budget).collect();
        let split_id = (self.send_split_id.fetch_add(1, Ordering::AcqRel) & 0xFFFF) as u16;
        let count = chunks.len() as u32;
        for (index, chunk) in chunks.into_iter().enumerate() {
            let frame = Frame {
                reliability: Reliability::ReliableOrdered,
                message_index: self.next_index(&self.send_message_index),
                sequence_index: 0,
                order_index,
                order_channel: 0,
                split: Some(SplitInfo {
                    count,
                    id: split_id,
                    index: index as u32,
                }),
                body: Bytes::copy_from_slice(chunk),
            };
            self.send_frame(frame).await?;
        }
        Ok(())
    }

    async fn send_frame(&self, frame: Frame) -> anyhow::Result<()> {
        let mut buf = WriteBuf::new();
        buf.write_u8(crate::DATAGRAM_FLAG_VALID)?;
        buf.write_u24(self.next_index(&self.send_seq))?;
        frame.serialize(&mut buf)?;
        self.transport.send(&buf.0).await?;
        Ok(())
    }

    fn next_index(&self, counter: &AtomicU32) -> u32 {
        counter.fetch_add(1, Ordering::AcqRel) & U24_MAX
    }

    /// Sends a disconnect notification and closes the session.
    pub async fn disconnect(&self) {
        if self.is_closed() {
            return;
        }
        let body = [RaknetMessage::DisconnectNotification.to_u8()];
        if let Err(err) = self.send_payload(&body).await {
            log::trace!("Could not send disconnect notification: {:?}", err);
        }
        self.mark_closed();
    }

    /// Marks the session closed without emitting anything.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        // notify_one stores a permit, so a receiver that isn't parked yet
        // still observes the close
        self.closed_notify.notify_one();
    }
}

/// Server-side offline handshake handling for a shared listener socket.
///
/// Returns a reply to send back for offline (pre-session) messages, and
/// whether the message completes the handshake (OpenConnectionRequest2).
pub struct OfflineHandshake {
    pub server_uuid: i64,
    pub mtu_cap: u16,
}

pub enum OfflineAction {
    Reply(Vec<u8>),
    /// Reply plus session establishment with the negotiated MTU.
    Establish(Vec<u8>, u16),
    Ignore,
}

impl OfflineHandshake {
    pub fn handle(&self, data: &[u8]) -> OfflineAction {
        let Some(&first) = data.first() else {
            return OfflineAction::Ignore;
        };
        let mut buf = ReadBuf::from(&data[1..]);
        match RaknetMessage::from_u8(first) {
            Some(RaknetMessage::OpenConnectionRequest1) => {
                let request = match MessageOpenConnectionRequest1::deserialize(&mut buf) {
                    Ok(request) => request,
                    Err(_) => return OfflineAction::Ignore,
                };
                let reply = MessageOpenConnectionReply1 {
                    server_uuid: self.server_uuid,
                    use_encryption: false,
                    preferred_mtu_size: request.mtu_size.min(self.mtu_cap),
                };
                match reply.to_bytes() {
                    Ok(bytes) => OfflineAction::Reply(bytes),
                    Err(_) => OfflineAction::Ignore,
                }
            }
            Some(RaknetMessage::OpenConnectionRequest2) => {
                let request = match MessageOpenConnectionRequest2::deserialize(&mut buf) {
                    Ok(request) => request,
                    Err(_) => return OfflineAction::Ignore,
                };
                let mtu = request.preferred_mtu_size.min(self.mtu_cap);
                let reply = MessageOpenConnectionReply2 {
                    server_uuid: self.server_uuid,
                    client_address: request.server_address,
                    use_encryption: false,
                    mtu_size: mtu,
                };
                match reply.to_bytes() {
                    Ok(bytes) => OfflineAction::Establish(bytes, mtu),
                    Err(_) => OfflineAction::Ignore,
                }
            }
            _ => OfflineAction::Ignore,
        }
    }
}

/// Dials a Raknet server over `transport` and completes the handshake.
///
/// ## Arguments
///
/// * `transport` - Packet transport to the server
/// * `server_addr` - Advertised server address for the handshake
/// * `mtu` - MTU to negotiate
pub async fn dial(
    transport: Arc<dyn PacketConn>,
    server_addr: SocketAddr,
    mtu: u16,
) -> anyhow::Result<Arc<RakConn>> {
    let client_uuid = rand::random::<i64>();
    let mut buf = [0u8; 2048];

    let request1 = MessageOpenConnectionRequest1 {
        raknet_protocol: ProtocolVersion::V11,
        mtu_size: mtu,
    };
    let reply1 = exchange_offline(
        &*transport,
        &request1.to_bytes()?,
        RaknetMessage::OpenConnectionReply1,
        &mut buf,
    )
    .await?;
    let mut read = ReadBuf::from(&reply1[1..]);
    let reply1 = MessageOpenConnectionReply1::deserialize(&mut read)?;
    let mtu = reply1.preferred_mtu_size.min(mtu);

    let request2 = MessageOpenConnectionRequest2 {
        client_uuid,
        server_address: server_addr,
        preferred_mtu_size: mtu,
    };
    let reply2 = exchange_offline(
        &*transport,
        &request2.to_bytes()?,
        RaknetMessage::OpenConnectionReply2,
        &mut buf,
    )
    .await?;
    let mut read = ReadBuf::from(&reply2[1..]);
    let reply2 = MessageOpenConnectionReply2::deserialize(&mut read)?;

    let conn = RakConn::new(transport, RakRole::Client, reply2.mtu_size.min(mtu));
    let request = MessageConnectionRequest {
        client_uuid,
        timestamp: 0,
        use_security: false,
    };
    conn.send_message(&request).await?;

    // drive the transport until the connection is acknowledged
    let deadline = Instant::now() + Duration::from_secs(5);
    while !conn.is_connected() {
        let len = match tokio::time::timeout_at(deadline, conn.transport().recv(&mut buf)).await {
            Ok(len) => len?,
            Err(_) => return Err(anyhow::anyhow!("connection request timed out")),
        };
        conn.handle_datagram(Bytes::copy_from_slice(&buf[..len]))
            .await?;
    }
    Ok(conn)
}

async fn exchange_offline(
    transport: &dyn PacketConn,
    request: &[u8],
    expect: RaknetMessage,
    buf: &mut [u8],
) -> anyhow::Result<Vec<u8>> {
    for attempt in 0..4 {
        transport.send(request).await?;
        let timeout = Duration::from_millis(500 * (attempt + 1));
        match tokio::time::timeout(timeout, transport.recv(buf)).await {
            Ok(Ok(len)) if len > 0 && RaknetMessage::from_u8(buf[0]) == Some(expect) => {
                return Ok(buf[..len].to_vec());
            }
            Ok(Ok(_)) => continue,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => continue,
        }
    }
    Err(anyhow::anyhow!(
        "no {:?} reply from the remote server",
        expect
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug)]
    struct RecordingConn(StdMutex<Vec<Vec<u8>>>);

    #[async_trait::async_trait]
    impl PacketConn for RecordingConn {
        async fn send(&self, data: &[u8]) -> io::Result<()> {
            self.0.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        async fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "test conn"))
        }
    }

    #[tokio::test]
    async fn game_packets_are_delivered_and_acked() {
        let transport = Arc::new(RecordingConn(StdMutex::new(Vec::new())));
        let conn = RakConn::new(transport.clone(), RakRole::Server, 1400);
        let datagram = frame::build_reliable_ordered(9, 0, 0, &[0xFE, 0x01, 0x02]);
        conn.handle_datagram(Bytes::from(datagram)).await.unwrap();

        let payload = conn.next_payload().await.unwrap();
        assert_eq!(&payload[..], &[0xFE, 0x01, 0x02]);

        let sent = transport.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0], crate::ACK_HEADER);
        // single-sequence record for datagram 9
        assert_eq!(&sent[0][1..], &[0x00, 0x01, 0x01, 0x09, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn large_payloads_are_fragmented() {
        let transport = Arc::new(RecordingConn(StdMutex::new(Vec::new())));
        let conn = RakConn::new(transport.clone(), RakRole::Client, 600);
        let mut body = vec![0xFE];
        body.extend(std::iter::repeat(0xAB).take(2000));
        conn.send_payload(&body).await.unwrap();

        let sent = transport.0.lock().unwrap();
        assert!(sent.len() > 1);
        // every datagram fits in the negotiated mtu
        assert!(sent.iter().all(|datagram| datagram.len() <= 600));

        // feeding the fragments into a server-side conn reassembles the body
        drop(sent);
        let server = RakConn::new(transport.clone(), RakRole::Server, 600);
        let fragments: Vec<Vec<u8>> = {
            let sent = transport.0.lock().unwrap();
            sent.clone()
        };
        for fragment in fragments {
            server
                .handle_datagram(Bytes::from(fragment))
                .await
                .unwrap();
        }
        let assembled = server.next_payload().await.unwrap();
        assert_eq!(assembled.len(), body.len());
        assert_eq!(&assembled[..], &body[..]);
    }

    #[tokio::test]
    async fn disconnect_notification_closes_session() {
        let transport = Arc::new(RecordingConn(StdMutex::new(Vec::new())));
        let conn = RakConn::new(transport, RakRole::Server, 1400);
        let datagram = frame::build_reliable_ordered(0, 0, 0, &[0x15]);
        conn.handle_datagram(Bytes::from(datagram)).await.unwrap();
        assert!(conn.is_closed());
    }
}
