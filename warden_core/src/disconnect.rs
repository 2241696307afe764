//! Synthesized Disconnect packets.
//!
//! A refusal is delivered twice: a game-level Disconnect carrying the
//! human-readable message, then a Raknet-level disconnect notification in
//! case the client no longer parses game packets (encrypted sessions).

use raknet::datatypes::WriteBuf;
use raknet::frame;
use raknet::message::RaknetMessage;
use raknet::GAME_PACKET_HEADER;

use crate::login::Compression;
use crate::session::Session;

/// Game packet id of Disconnect.
const DISCONNECT_PACKET_ID: u32 = 0x05;
/// Disconnect reason shown as "kicked" by the client.
const DISCONNECT_REASON_KICKED: i32 = 5;

fn zigzag(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

fn write_string(buf: &mut WriteBuf, value: &str) {
    let _ = buf.write_var_u32(value.len() as u32);
    buf.0.extend_from_slice(value.as_bytes());
}

/// Builds a complete game packet (leading 0xFE) holding a single-batch
/// Disconnect with the given message.
///
/// The compression should match whatever the client negotiated; it is
/// taken from the observed Login packet, defaulting to Flate.
pub fn build_game_disconnect(message: &str, compression: Compression) -> Vec<u8> {
    let mut packet = WriteBuf::new();
    let _ = packet.write_var_u32(DISCONNECT_PACKET_ID);
    let _ = packet.write_var_u32(zigzag(DISCONNECT_REASON_KICKED));
    let _ = packet.write_bool(false); // show the disconnection screen
    write_string(&mut packet, message);
    write_string(&mut packet, message); // filtered variant

    let mut batch = WriteBuf::new();
    let _ = batch.write_var_u32(packet.0.len() as u32);
    batch.0.extend_from_slice(&packet.0);

    let body = match compression {
        Compression::None => batch.0.to_vec(),
        Compression::Flate => {
            use flate2::write::DeflateEncoder;
            use std::io::Write;
            let mut encoder = DeflateEncoder::new(Vec::new(), flate2::Compression::default());
            // writing to a Vec cannot fail
            let _ = encoder.write_all(&batch.0);
            encoder.finish().unwrap_or_default()
        }
        Compression::Snappy => snap::raw::Encoder::new()
            .compress_vec(&batch.0)
            .unwrap_or_default(),
    };
    let mut out = vec![GAME_PACKET_HEADER, compression.to_id()];
    out.extend_from_slice(&body);
    out
}

/// Builds a Raknet datagram injecting a game Disconnect into a raw-UDP
/// session, framed with indices past anything the server has sent.
pub fn build_injected_disconnect(session: &Session, message: &str) -> Vec<u8> {
    let compression =
        Compression::from_id(session.login_compression.load(std::sync::atomic::Ordering::Acquire))
            .unwrap_or(Compression::Flate);
    let game_packet = build_game_disconnect(message, compression);
    let (seq, message_index, order_index) = session.next_injected_indices();
    frame::build_reliable_ordered(seq, message_index, order_index, &game_packet)
}

/// The Raknet-level disconnect notification datagram.
pub fn raknet_disconnect_bytes() -> [u8; 1] {
    [RaknetMessage::DisconnectNotification.to_u8()]
}

/// Best-effort parse of an *unencrypted* game Disconnect, to surface the
/// reason at session close. Returns the human-readable message.
pub fn parse_game_disconnect(data: &[u8]) -> Option<String> {
    use raknet::datatypes::ReadBuf;

    if data.len() < 3 || data[0] != GAME_PACKET_HEADER {
        return None;
    }
    let compression = Compression::from_id(data[1])?;
    let batch = match compression {
        Compression::None => data[2..].to_vec(),
        Compression::Flate => {
            use std::io::Read;
            let mut out = Vec::new();
            flate2::read::DeflateDecoder::new(&data[2..])
                .take(crate::login::MAX_DECOMPRESSED_LEN as u64)
                .read_to_end(&mut out)
                .ok()?;
            out
        }
        Compression::Snappy => snap::raw::Decoder::new().decompress_vec(&data[2..]).ok()?,
    };
    let mut buf = ReadBuf::new(bytes::Bytes::from(batch));
    let entry_len = buf.read_var_u32().ok()? as usize;
    if entry_len > buf.remaining() {
        return None;
    }
    let mut entry = ReadBuf::new(buf.0.split_to(entry_len));
    if entry.read_var_u32().ok()? & 0x3FF != DISCONNECT_PACKET_ID {
        return None;
    }
    let _reason = entry.read_var_u32().ok()?;
    let hide_screen = entry.read_bool().ok()?;
    if hide_screen {
        return Some(String::new());
    }
    let message_len = entry.read_var_u32().ok()? as usize;
    if message_len > entry.remaining() {
        return None;
    }
    let mut message = vec![0u8; message_len];
    entry.read_bytes(&mut message).ok()?;
    String::from_utf8(message).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use raknet::datatypes::ReadBuf;
    use raknet::frame::{Datagram, Reliability};

    fn unwrap_batch(packet: &[u8]) -> Vec<u8> {
        assert_eq!(packet[0], GAME_PACKET_HEADER);
        let compression = Compression::from_id(packet[1]).unwrap();
        match compression {
            Compression::None => packet[2..].to_vec(),
            Compression::Flate => {
                use std::io::Read;
                let mut out = Vec::new();
                flate2::read::DeflateDecoder::new(&packet[2..])
                    .read_to_end(&mut out)
                    .unwrap();
                out
            }
            Compression::Snappy => snap::raw::Decoder::new()
                .decompress_vec(&packet[2..])
                .unwrap(),
        }
    }

    #[test]
    fn disconnect_message_survives_every_compression() {
        for compression in [Compression::None, Compression::Flate, Compression::Snappy] {
            let packet = build_game_disconnect("§ctest message", compression);
            let batch = unwrap_batch(&packet);
            let mut buf = ReadBuf::new(Bytes::from(batch));
            let entry_len = buf.read_var_u32().unwrap() as usize;
            assert_eq!(entry_len, buf.remaining());
            assert_eq!(buf.read_var_u32().unwrap() & 0x3FF, DISCONNECT_PACKET_ID);
            let _reason = buf.read_var_u32().unwrap();
            let _hide = buf.read_bool().unwrap();
            let message_len = buf.read_var_u32().unwrap() as usize;
            let mut message = vec![0u8; message_len];
            buf.read_bytes(&mut message).unwrap();
            assert_eq!(String::from_utf8(message).unwrap(), "§ctest message");
        }
    }

    #[test]
    fn built_disconnect_parses_back() {
        let packet = build_game_disconnect("§c黑名单用户\n§7玩家名字：Alice", Compression::Flate);
        assert_eq!(
            parse_game_disconnect(&packet).as_deref(),
            Some("§c黑名单用户\n§7玩家名字：Alice")
        );
        // encrypted-looking packets are never parsed
        assert!(parse_game_disconnect(&[GAME_PACKET_HEADER, 0x42, 0x00]).is_none());
    }

    #[test]
    fn injected_disconnect_is_reliable_ordered() {
        let session = crate::session::tests_support::session_for_tests();
        session.observe_send_state(10, 20, 30);
        let datagram = build_injected_disconnect(&session, "bye");
        let parsed = Datagram::parse(Bytes::from(datagram)).unwrap();
        assert_eq!(parsed.sequence, 11);
        let frame = parsed.frames().next().unwrap().unwrap();
        assert_eq!(frame.reliability, Reliability::ReliableOrdered);
        assert_eq!(frame.message_index, 21);
        assert_eq!(frame.order_index, 31);
        assert_eq!(frame.body[0], GAME_PACKET_HEADER);
    }
}
