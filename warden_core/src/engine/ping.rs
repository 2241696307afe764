//! Unconnected (server list) ping handling.
//!
//! Pre-session pings never create state beyond a per-IP rate-limit entry.
//! The advertisement is either the configured custom MOTD or the remote's
//! own pong, cached and refreshed at most once a minute with exponential
//! backoff on failure. When enabled, the measured latency is embedded
//! into the advertisement's display name.

use std::{
    hash::{Hash, Hasher},
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use raknet::bedrock::{BedrockEdition, GameMode, Motd};
use raknet::datatypes::ReadBuf;
use raknet::message::{Message, MessageUnconnectedPing, MessageUnconnectedPong};
use tokio::net::UdpSocket;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::Instant;

/// Minimum spacing between two pongs to the same IP.
const PONG_RATE_LIMIT: Duration = Duration::from_millis(200);
/// Minimum spacing between two advertisement refreshes.
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);
/// Backoff cap after consecutive refresh failures.
const REFRESH_BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Derives the stable per-server GUID advertised in pongs.
pub fn server_guid(server_id: &str) -> i64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    server_id.hash(&mut hasher);
    hasher.finish() as i64
}

struct AdvertisementCache {
    /// Raw advertisement payload from the remote, if fetched.
    advertisement: Option<String>,
    /// Measured round trip to the remote; negative means offline.
    latency_ms: i64,
    last_refresh: Option<Instant>,
    consecutive_failures: u32,
}

pub struct PingResponder {
    server_id: String,
    guid: i64,
    rate: DashMap<IpAddr, Instant>,
    cache: RwLock<AdvertisementCache>,
    /// In-flight guard so only one refresh runs at a time.
    refresh_lock: Semaphore,
}

impl PingResponder {
    pub fn new(server_id: String) -> Self {
        let guid = server_guid(&server_id);
        Self {
            server_id,
            guid,
            rate: DashMap::new(),
            cache: RwLock::new(AdvertisementCache {
                advertisement: None,
                latency_ms: -1,
                last_refresh: None,
                consecutive_failures: 0,
            }),
            refresh_lock: Semaphore::new(1),
        }
    }

    pub fn guid(&self) -> i64 {
        self.guid
    }

    /// Last measured latency to the remote, if the cache has one.
    pub async fn latency_ms(&self) -> Option<i64> {
        let cache = self.cache.read().await;
        (cache.latency_ms >= 0).then_some(cache.latency_ms)
    }

    /// Replies to an unconnected ping datagram. Returns whether a pong
    /// was sent (rate-limited or malformed pings are silently dropped).
    pub async fn handle_ping(
        &self,
        socket: &UdpSocket,
        addr: SocketAddr,
        data: &[u8],
        custom_motd: Option<&str>,
        show_real_latency: bool,
        listen_port: u16,
    ) -> anyhow::Result<bool> {
        if !self.check_rate(addr.ip()) {
            return Ok(false);
        }
        let mut buf = ReadBuf::new(Bytes::copy_from_slice(&data[1..]));
        let ping = MessageUnconnectedPing::deserialize(&mut buf)?;

        let (cached, latency_ms) = {
            let cache = self.cache.read().await;
            (cache.advertisement.clone(), cache.latency_ms)
        };
        let advertisement = custom_motd
            .map(str::to_owned)
            .or(cached)
            .unwrap_or_else(|| self.default_advertisement(listen_port));
        let mut advertisement = rebrand_advertisement(&advertisement, self.guid, listen_port);
        if show_real_latency {
            advertisement = apply_latency_tag(&advertisement, latency_ms);
        }

        let pong = MessageUnconnectedPong {
            timestamp: ping.forward_timestamp,
            server_uuid: self.guid,
            motd: advertisement,
        };
        socket.send_to(&pong.to_bytes()?, addr).await?;
        Ok(true)
    }

    fn check_rate(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut allowed = true;
        self.rate
            .entry(ip)
            .and_modify(|last| {
                if now.duration_since(*last) < PONG_RATE_LIMIT {
                    allowed = false;
                } else {
                    *last = now;
                }
            })
            .or_insert(now);
        allowed
    }

    /// Drops expired rate-limit entries. Called from the cleanup tick.
    pub fn gc_rate_limits(&self) {
        let now = Instant::now();
        self.rate
            .retain(|_, last| now.duration_since(*last) < PONG_RATE_LIMIT * 10);
    }

    /// Fetches the remote advertisement if the cache is due. Failures
    /// back the refresh off exponentially, up to five minutes.
    pub async fn maybe_refresh(&self, target: &str) {
        let _permit = match self.refresh_lock.try_acquire() {
            Ok(permit) => permit,
            Err(_) => return,
        };
        {
            let cache = self.cache.read().await;
            let wait = REFRESH_INTERVAL
                .saturating_mul(2u32.saturating_pow(cache.consecutive_failures))
                .min(REFRESH_BACKOFF_CAP);
            if let Some(last) = cache.last_refresh {
                if last.elapsed() < wait {
                    return;
                }
            }
        }
        let result = raknet::bedrock::ping("0.0.0.0:0", target, Duration::from_secs(4)).await;
        let mut cache = self.cache.write().await;
        cache.last_refresh = Some(Instant::now());
        match result {
            Ok(outcome) => {
                log::debug!(
                    "[{}] Refreshed advertisement from {} ({} ms)",
                    self.server_id,
                    target,
                    outcome.latency.as_millis()
                );
                cache.advertisement = Some(outcome.advertisement);
                cache.latency_ms = outcome.latency.as_millis() as i64;
                cache.consecutive_failures = 0;
            }
            Err(err) => {
                log::warn!(
                    "[{}] Could not refresh advertisement from {}: {:?}",
                    self.server_id,
                    target,
                    err
                );
                cache.latency_ms = -1;
                cache.consecutive_failures = cache.consecutive_failures.saturating_add(1);
            }
        }
    }

    fn default_advertisement(&self, listen_port: u16) -> String {
        Motd {
            server_uuid: self.guid,
            edition: BedrockEdition::PocketEdition,
            protocol_version: 0,
            version_name: String::new(),
            lines: [self.server_id.clone(), String::new()],
            player_count: 0,
            max_player_count: 0,
            gamemode: GameMode::Survival,
            nintendo_limited: false,
            port_v4: listen_port,
            port_v6: listen_port,
        }
        .encode_payload()
    }
}

/// Rewrites the GUID and port fields so the pong points at this proxy
/// instead of the remote.
fn rebrand_advertisement(advertisement: &str, guid: i64, listen_port: u16) -> String {
    match Motd::decode_payload(advertisement) {
        Some(mut motd) => {
            motd.server_uuid = guid;
            motd.port_v4 = listen_port;
            motd.port_v6 = listen_port;
            if motd.lines[0].is_empty() {
                // a pong with an empty title is ignored by clients
                motd.lines[0] = "...".into();
            }
            motd.encode_payload()
        }
        None => advertisement.to_owned(),
    }
}

/// Suffixes the advertisement's display name with a colored latency tag.
pub fn apply_latency_tag(advertisement: &str, latency_ms: i64) -> String {
    let mut fields: Vec<&str> = advertisement.split(';').collect();
    if fields.len() < 2 {
        return advertisement.to_owned();
    }
    let tag = latency_tag(latency_ms);
    let tagged = format!("{} {}", fields[1], tag);
    fields[1] = &tagged;
    fields.join(";")
}

fn latency_tag(latency_ms: i64) -> String {
    if latency_ms < 0 {
        return "§c[离线]".to_owned();
    }
    let color = match latency_ms {
        0..=49 => "§a",
        50..=99 => "§e",
        100..=199 => "§6",
        _ => "§c",
    };
    format!("{color}[{latency_ms}ms]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_is_stable_per_server() {
        assert_eq!(server_guid("lobby"), server_guid("lobby"));
        assert_ne!(server_guid("lobby"), server_guid("survival"));
    }

    #[test]
    fn latency_tag_colors() {
        assert_eq!(latency_tag(37), "§a[37ms]");
        assert_eq!(latency_tag(72), "§e[72ms]");
        assert_eq!(latency_tag(150), "§6[150ms]");
        assert_eq!(latency_tag(400), "§c[400ms]");
        assert_eq!(latency_tag(-1), "§c[离线]");
    }

    #[test]
    fn tag_lands_on_the_second_field() {
        let advertisement = "MCPE;My Server;712;1.21.2;3;20;42;line2;Survival;1;19132;19132;";
        let tagged = apply_latency_tag(advertisement, 37);
        assert!(tagged.starts_with("MCPE;My Server §a[37ms];712;"));
    }

    #[test]
    fn rebrand_rewrites_guid_and_ports() {
        let advertisement = "MCPE;Remote;712;1.21.2;3;20;999;line2;Survival;1;20000;20001;";
        let rebranded = rebrand_advertisement(advertisement, 42, 19132);
        let motd = Motd::decode_payload(&rebranded).unwrap();
        assert_eq!(motd.server_uuid, 42);
        assert_eq!(motd.port_v4, 19132);
        assert_eq!(motd.port_v6, 19132);
    }

    #[tokio::test]
    async fn rate_limit_allows_one_per_window() {
        let responder = PingResponder::new("s1".to_owned());
        let ip = IpAddr::from([10, 0, 0, 1]);
        assert!(responder.check_rate(ip));
        assert!(!responder.check_rate(ip));
        // a different ip has its own window
        assert!(responder.check_rate(IpAddr::from([10, 0, 0, 2])));
    }

    #[tokio::test]
    async fn pong_echoes_timestamp_and_stable_guid() {
        let responder = PingResponder::new("s1".to_owned());
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let receiver_addr = receiver.local_addr().unwrap();

        let ping = MessageUnconnectedPing {
            client_uuid: 7,
            forward_timestamp: 1000,
        };
        let sent = responder
            .handle_ping(
                &socket,
                receiver_addr,
                &ping.to_bytes().unwrap(),
                None,
                false,
                19132,
            )
            .await
            .unwrap();
        assert!(sent);

        let mut buf = [0u8; 1492];
        let len = receiver.recv(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x1C);
        let mut read = ReadBuf::new(Bytes::copy_from_slice(&buf[1..len]));
        let pong = MessageUnconnectedPong::deserialize(&mut read).unwrap();
        assert_eq!(pong.timestamp, 1000);
        assert_eq!(pong.server_uuid, server_guid("s1"));
    }
}
