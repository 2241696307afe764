//! Login handshake inspection.
//!
//! Peeks into an unencrypted game packet to pull the player identity out
//! of the Login JWT chain. JWTs are decoded, never verified; the proxy is
//! not the authenticator. Every malformed layer simply yields no
//! identity, in which case the packet is forwarded untouched.

use std::io::Read;

use base64::Engine;
use bytes::Bytes;
use raknet::datatypes::ReadBuf;
use raknet::GAME_PACKET_HEADER;
use serde::Deserialize;

/// Output cap for batch decompression, against zip bombs.
pub const MAX_DECOMPRESSED_LEN: usize = 16 * 1024 * 1024;

/// Game packet id of Login, after masking the low 10 header bits.
const LOGIN_PACKET_ID: u32 = 0x01;

/// Batch compression negotiated by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Flate,
    Snappy,
    None,
}

impl Compression {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x00 => Some(Self::Flate),
            0x01 => Some(Self::Snappy),
            0xFF => Some(Self::None),
            _ => None,
        }
    }

    pub fn to_id(self) -> u8 {
        match self {
            Self::Flate => 0x00,
            Self::Snappy => 0x01,
            Self::None => 0xFF,
        }
    }
}

/// Identity extracted from the Login JWT chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerIdentity {
    pub display_name: String,
    pub uuid: String,
    pub xuid: String,
}

/// A successfully recognized Login packet.
#[derive(Debug, Clone)]
pub struct LoginInfo {
    pub identity: PlayerIdentity,
    /// Game protocol version, recorded for logging only.
    pub protocol_version: i32,
    /// Compression the packet was wrapped with.
    pub compression: Compression,
}

#[derive(Deserialize)]
struct ChainEnvelope {
    #[serde(default)]
    chain: Vec<String>,
    #[serde(rename = "Certificate", default)]
    certificate: Option<String>,
}

#[derive(Deserialize)]
struct JwtClaims {
    #[serde(rename = "extraData", default)]
    extra_data: Option<ExtraData>,
}

#[derive(Deserialize, Default)]
struct ExtraData {
    #[serde(rename = "displayName", default)]
    display_name: String,
    #[serde(default)]
    identity: String,
    #[serde(rename = "XUID", default)]
    xuid: String,
}

/// Attempts to recognize a Login inside a (reassembled) game packet.
///
/// Returns [`None`] when the packet is not a Login, is already encrypted,
/// or is malformed in any layer.
pub fn parse_game_packet(data: &[u8]) -> Option<LoginInfo> {
    if data.len() < 3 || data[0] != GAME_PACKET_HEADER {
        return None;
    }
    // an unknown compression id means the session is already encrypted
    let compression = Compression::from_id(data[1])?;
    let batch = decompress(compression, &data[2..])?;

    let mut buf = ReadBuf::new(Bytes::from(batch));
    while buf.remaining() > 0 {
        let entry_len = buf.read_var_u32().ok()? as usize;
        if entry_len == 0 || entry_len > buf.remaining() {
            return None;
        }
        let mut entry = ReadBuf::new(buf.0.split_to(entry_len));
        let header = entry.read_var_u32().ok()?;
        if header & 0x3FF != LOGIN_PACKET_ID {
            return None;
        }
        let protocol_version = entry.read_i32().ok()?;
        let chain_len = entry.read_var_u32().ok()? as usize;
        if chain_len > entry.remaining() {
            return None;
        }
        let chain_json = entry.0.split_to(chain_len);
        let identity = extract_identity(&chain_json)?;
        return Some(LoginInfo {
            identity,
            protocol_version,
            compression,
        });
    }
    None
}

fn decompress(compression: Compression, body: &[u8]) -> Option<Vec<u8>> {
    match compression {
        Compression::None => {
            if body.len() > MAX_DECOMPRESSED_LEN {
                return None;
            }
            Some(body.to_vec())
        }
        Compression::Flate => {
            let mut out = Vec::new();
            let decoder = flate2::read::DeflateDecoder::new(body);
            match decoder
                .take(MAX_DECOMPRESSED_LEN as u64 + 1)
                .read_to_end(&mut out)
            {
                Ok(_) if out.len() <= MAX_DECOMPRESSED_LEN => Some(out),
                Ok(_) => {
                    log::debug!("Batch inflates past the {} byte cap", MAX_DECOMPRESSED_LEN);
                    None
                }
                Err(err) => {
                    log::trace!("Batch inflate failed: {:?}", err);
                    None
                }
            }
        }
        Compression::Snappy => {
            let len = snap::raw::decompress_len(body).ok()?;
            if len > MAX_DECOMPRESSED_LEN {
                log::debug!("Batch snappy length {} over the cap", len);
                return None;
            }
            snap::raw::Decoder::new().decompress_vec(body).ok()
        }
    }
}

/// Walks the JWT chain JSON and returns the first identity with a
/// non-empty display name.
fn extract_identity(chain_json: &[u8]) -> Option<PlayerIdentity> {
    let envelope: ChainEnvelope = serde_json::from_slice(chain_json).ok()?;
    let chain = if !envelope.chain.is_empty() {
        envelope.chain
    } else {
        // legacy shape: the chain hides inside a nested Certificate string
        let certificate = envelope.certificate?;
        let inner: ChainEnvelope = serde_json::from_str(&certificate).ok()?;
        inner.chain
    };
    for jwt in &chain {
        let Some(claims) = decode_jwt_claims(jwt) else {
            continue;
        };
        let Some(extra) = claims.extra_data else {
            continue;
        };
        if extra.display_name.is_empty() {
            continue;
        }
        return Some(PlayerIdentity {
            display_name: extra.display_name,
            uuid: extra.identity,
            xuid: extra.xuid,
        });
    }
    None
}

fn decode_jwt_claims(jwt: &str) -> Option<JwtClaims> {
    let payload = jwt.split('.').nth(1)?;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(payload))
        .ok()?;
    serde_json::from_slice(&decoded).ok()
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use raknet::datatypes::WriteBuf;
    use serde_json::json;

    pub(crate) fn forge_jwt(display_name: &str, uuid: &str, xuid: &str) -> String {
        let engine = &base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header = engine.encode(r#"{"alg":"ES384","x5u":"test"}"#);
        let payload = engine.encode(
            json!({
                "extraData": {
                    "displayName": display_name,
                    "identity": uuid,
                    "XUID": xuid,
                }
            })
            .to_string(),
        );
        format!("{header}.{payload}.sig")
    }

    pub(crate) fn forge_login_batch(chain_json: &str, protocol: i32) -> Vec<u8> {
        let mut entry = WriteBuf::new();
        entry.write_var_u32(LOGIN_PACKET_ID).unwrap();
        entry.write_i32(protocol).unwrap();
        entry.write_var_u32(chain_json.len() as u32).unwrap();
        entry.0.extend_from_slice(chain_json.as_bytes());

        let mut batch = WriteBuf::new();
        batch.write_var_u32(entry.0.len() as u32).unwrap();
        batch.0.extend_from_slice(&entry.0);
        batch.0.to_vec()
    }

    pub(crate) fn forge_game_packet(compression: Compression, batch: &[u8]) -> Vec<u8> {
        let body = match compression {
            Compression::None => batch.to_vec(),
            Compression::Flate => {
                use flate2::write::DeflateEncoder;
                use std::io::Write;
                let mut encoder = DeflateEncoder::new(Vec::new(), flate2::Compression::fast());
                encoder.write_all(batch).unwrap();
                encoder.finish().unwrap()
            }
            Compression::Snappy => snap::raw::Encoder::new().compress_vec(batch).unwrap(),
        };
        let mut packet = vec![GAME_PACKET_HEADER, compression.to_id()];
        packet.extend_from_slice(&body);
        packet
    }

    /// A complete reliable-frame datagram carrying a Login for a player.
    pub(crate) fn forge_login_datagram(display_name: &str, uuid: &str, xuid: &str) -> Vec<u8> {
        let jwt = forge_jwt(display_name, uuid, xuid);
        let chain = json!({ "chain": [jwt] }).to_string();
        let packet = forge_game_packet(Compression::None, &forge_login_batch(&chain, 712));
        raknet::frame::build_reliable_ordered(0, 0, 0, &packet)
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::*;
    use super::*;
    use raknet::datatypes::WriteBuf;
    use serde_json::json;

    #[test]
    fn extracts_identity_from_chain() {
        let jwt = forge_jwt("Alice", "u-1", "x-1");
        let chain = json!({ "chain": [jwt] }).to_string();
        for compression in [Compression::None, Compression::Flate, Compression::Snappy] {
            let packet = forge_game_packet(compression, &forge_login_batch(&chain, 712));
            let info = parse_game_packet(&packet).unwrap();
            assert_eq!(info.identity.display_name, "Alice");
            assert_eq!(info.identity.uuid, "u-1");
            assert_eq!(info.identity.xuid, "x-1");
            assert_eq!(info.protocol_version, 712);
            assert_eq!(info.compression, compression);
        }
    }

    #[test]
    fn certificate_envelope_is_supported() {
        let jwt = forge_jwt("Bob", "u-2", "x-2");
        let inner = json!({ "chain": [jwt] }).to_string();
        let chain = json!({ "AuthenticationType": 0, "Certificate": inner }).to_string();
        let packet = forge_game_packet(Compression::None, &forge_login_batch(&chain, 712));
        let info = parse_game_packet(&packet).unwrap();
        assert_eq!(info.identity.display_name, "Bob");
    }

    #[test]
    fn skips_chain_links_without_display_name() {
        let anonymous = forge_jwt("", "", "");
        let named = forge_jwt("Carol", "u-3", "x-3");
        let chain = json!({ "chain": [anonymous, named] }).to_string();
        let packet = forge_game_packet(Compression::None, &forge_login_batch(&chain, 712));
        let info = parse_game_packet(&packet).unwrap();
        assert_eq!(info.identity.display_name, "Carol");
    }

    #[test]
    fn unknown_compression_means_encrypted() {
        let packet = [GAME_PACKET_HEADER, 0x7B, 0xDE, 0xAD];
        assert!(parse_game_packet(&packet).is_none());
    }

    #[test]
    fn non_login_packet_is_ignored() {
        let mut entry = WriteBuf::new();
        entry.write_var_u32(0x02).unwrap(); // not Login
        let mut batch = WriteBuf::new();
        batch.write_var_u32(entry.0.len() as u32).unwrap();
        batch.0.extend_from_slice(&entry.0);
        let packet = forge_game_packet(Compression::None, &batch.0);
        assert!(parse_game_packet(&packet).is_none());
    }

    #[test]
    fn truncated_chain_is_rejected() {
        let chain = json!({ "chain": ["a.b"] }).to_string();
        let mut packet = forge_game_packet(Compression::None, &forge_login_batch(&chain, 712));
        packet.truncate(packet.len() / 2);
        assert!(parse_game_packet(&packet).is_none());
    }
}
