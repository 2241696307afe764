//! Generic local proxy ports.
//!
//! A proxy port accepts SOCKS4/SOCKS5/HTTP CONNECT clients on a TCP
//! listener and splices each stream through the outbound manager. This is
//! independent of the game protocol; it exists so user traffic can share
//! the configured outbound nodes. A port is active only when both the
//! global switch and its own flag are on.

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::config::{LatencySort, LoadBalanceStrategy};
use crate::outbound::OutboundManager;

/// Accepted client protocol of a proxy port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyPortKind {
    Socks,
    Http,
    /// Sniff the first byte: 0x04/0x05 is SOCKS, anything else HTTP.
    #[default]
    Mixed,
}

/// Configuration of one proxy port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyPortConfig {
    pub listen_addr: String,
    #[serde(default)]
    pub kind: ProxyPortKind,
    /// Per-port switch, ANDed with the global `proxy_ports_enabled`.
    #[serde(default)]
    pub enabled: bool,
    /// Outbound selector; empty means direct.
    #[serde(default)]
    pub outbound: String,
    #[serde(default)]
    pub load_balance: LoadBalanceStrategy,
    #[serde(default)]
    pub load_balance_sort: LatencySort,
    /// Static credentials. When set, SOCKS5 requires username/password
    /// auth and HTTP requires basic proxy authorization.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Client IPs allowed to connect; empty allows everyone.
    #[serde(default)]
    pub allow_ips: Vec<IpAddr>,
}

pub struct ProxyPortListener {
    config: ProxyPortConfig,
    outbounds: Arc<OutboundManager>,
    listener: TcpListener,
    closed: AtomicBool,
    stop_notify: Notify,
}

impl ProxyPortListener {
    pub async fn bind(
        config: ProxyPortConfig,
        outbounds: Arc<OutboundManager>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        log::info!(
            "Proxy port ({:?}) listening on {}",
            config.kind,
            config.listen_addr
        );
        Ok(Self {
            config,
            outbounds,
            listener,
            closed: AtomicBool::new(false),
            stop_notify: Notify::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stop(&self) {
        self.closed.store(true, Ordering::Release);
        self.stop_notify.notify_waiters();
    }

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.stop_notify.notified() => return Ok(()),
                res = self.listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            if self.closed.load(Ordering::Acquire) {
                                return Ok(());
                            }
                            log::warn!("Proxy port accept error: {:?}", err);
                            continue;
                        }
                    };
                    if !self.ip_allowed(peer.ip()) {
                        log::debug!("Rejecting proxy client {} (not in allow list)", peer);
                        continue;
                    }
                    tokio::spawn({
                        let listener = self.clone();
                        async move {
                            if let Err(err) = listener.handle_client(stream, peer).await {
                                log::debug!("Proxy client {} failed: {:?}", peer, err);
                            }
                        }
                    });
                }
            }
        }
    }

    fn ip_allowed(&self, ip: IpAddr) -> bool {
        self.config.allow_ips.is_empty() || self.config.allow_ips.contains(&ip)
    }

    async fn handle_client(&self, mut stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        let first = stream.read_u8().await?;
        let target = match (self.config.kind, first) {
            (ProxyPortKind::Socks | ProxyPortKind::Mixed, 0x05) => {
                self.socks5_handshake(&mut stream).await?
            }
            (ProxyPortKind::Socks | ProxyPortKind::Mixed, 0x04) => {
                self.socks4_handshake(&mut stream).await?
            }
            (ProxyPortKind::Http | ProxyPortKind::Mixed, first) => {
                self.http_connect_handshake(&mut stream, first).await?
            }
            (ProxyPortKind::Socks, _) => {
                return Err(anyhow::anyhow!("not a socks client"));
            }
        };
        log::debug!("Proxy client {} -> {}", peer, target);

        let dialed = self
            .outbounds
            .dial_stream_with_failover(
                "proxy-port",
                &self.config.outbound,
                self.config.load_balance,
                self.config.load_balance_sort,
                &target,
            )
            .await;
        let (mut remote, _guard) = match dialed {
            Ok(dialed) => dialed,
            Err(err) => {
                log::debug!("Proxy dial to {} failed: {}", target, err);
                return Err(err.into());
            }
        };
        match tokio::io::copy_bidirectional(&mut stream, &mut remote).await {
            Ok((up, down)) => {
                log::debug!(
                    "Proxy client {} done ({} bytes up, {} bytes down)",
                    peer,
                    up,
                    down
                );
            }
            Err(err) => {
                log::trace!("Proxy splice for {} ended: {:?}", peer, err);
            }
        }
        Ok(())
    }

    /// SOCKS5 greeting, optional username/password subnegotiation, and
    /// CONNECT request. The version byte has already been consumed.
    async fn socks5_handshake(&self, stream: &mut TcpStream) -> anyhow::Result<String> {
        let method_count = stream.read_u8().await? as usize;
        let mut methods = vec![0u8; method_count];
        stream.read_exact(&mut methods).await?;

        let needs_auth = self.config.username.is_some();
        let chosen: u8 = if needs_auth { 0x02 } else { 0x00 };
        if (needs_auth && !methods.contains(&0x02)) || (!needs_auth && !methods.contains(&0x00)) {
            stream.write_all(&[0x05, 0xFF]).await?;
            return Err(anyhow::anyhow!("no acceptable auth method"));
        }
        stream.write_all(&[0x05, chosen]).await?;

        if needs_auth {
            let version = stream.read_u8().await?;
            if version != 0x01 {
                return Err(anyhow::anyhow!("bad auth subnegotiation version"));
            }
            let username = read_length_prefixed(stream).await?;
            let password = read_length_prefixed(stream).await?;
            let ok = self.config.username.as_deref() == Some(username.as_str())
                && self.config.password.as_deref() == Some(password.as_str());
            stream.write_all(&[0x01, if ok { 0x00 } else { 0x01 }]).await?;
            if !ok {
                return Err(anyhow::anyhow!("bad credentials"));
            }
        }

        let mut request = [0u8; 4];
        stream.read_exact(&mut request).await?;
        if request[0] != 0x05 || request[1] != 0x01 {
            stream
                .write_all(&[0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            return Err(anyhow::anyhow!("only CONNECT is supported"));
        }
        let host = match request[3] {
            0x01 => {
                let mut octets = [0u8; 4];
                stream.read_exact(&mut octets).await?;
                IpAddr::from(octets).to_string()
            }
            0x03 => {
                let len = stream.read_u8().await? as usize;
                let mut domain = vec![0u8; len];
                stream.read_exact(&mut domain).await?;
                String::from_utf8(domain)?
            }
            0x04 => {
                let mut octets = [0u8; 16];
                stream.read_exact(&mut octets).await?;
                format!("[{}]", IpAddr::from(octets))
            }
            other => return Err(anyhow::anyhow!("unsupported address type {other}")),
        };
        let port = stream.read_u16().await?;
        stream
            .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await?;
        Ok(format!("{host}:{port}"))
    }

    /// SOCKS4 CONNECT. The version byte has already been consumed.
    async fn socks4_handshake(&self, stream: &mut TcpStream) -> anyhow::Result<String> {
        let command = stream.read_u8().await?;
        if command != 0x01 {
            stream.write_all(&[0x00, 91, 0, 0, 0, 0, 0, 0]).await?;
            return Err(anyhow::anyhow!("only CONNECT is supported"));
        }
        let port = stream.read_u16().await?;
        let mut octets = [0u8; 4];
        stream.read_exact(&mut octets).await?;
        // user id, null-terminated
        loop {
            if stream.read_u8().await? == 0 {
                break;
            }
        }
        // socks4a: 0.0.0.x means a domain follows
        let host = if octets[0] == 0 && octets[1] == 0 && octets[2] == 0 && octets[3] != 0 {
            let mut domain = Vec::new();
            loop {
                let byte = stream.read_u8().await?;
                if byte == 0 {
                    break;
                }
                domain.push(byte);
            }
            String::from_utf8(domain)?
        } else {
            IpAddr::from(octets).to_string()
        };
        stream.write_all(&[0x00, 90, 0, 0, 0, 0, 0, 0]).await?;
        Ok(format!("{host}:{port}"))
    }

    /// HTTP CONNECT. `first` is the already-consumed first request byte.
    async fn http_connect_handshake(
        &self,
        stream: &mut TcpStream,
        first: u8,
    ) -> anyhow::Result<String> {
        let mut raw = vec![first];
        let mut byte = [0u8; 1];
        while !raw.ends_with(b"\r\n\r\n") {
            if raw.len() > 8192 {
                return Err(anyhow::anyhow!("oversized http request"));
            }
            stream.read_exact(&mut byte).await?;
            raw.push(byte[0]);
        }
        let request = String::from_utf8_lossy(&raw);
        let mut lines = request.lines();
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (method, target) = (
            parts.next().unwrap_or_default(),
            parts.next().unwrap_or_default(),
        );
        if !method.eq_ignore_ascii_case("CONNECT") || target.is_empty() {
            stream
                .write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n")
                .await?;
            return Err(anyhow::anyhow!("only CONNECT is supported"));
        }
        if let Some(expected) = self.basic_auth_token() {
            let authorized = lines.any(|line| {
                line.to_ascii_lowercase()
                    .starts_with("proxy-authorization: basic ")
                    && line.ends_with(&expected)
            });
            if !authorized {
                stream
                    .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic\r\n\r\n")
                    .await?;
                return Err(anyhow::anyhow!("missing proxy credentials"));
            }
        }
        stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        Ok(target.to_owned())
    }

    fn basic_auth_token(&self) -> Option<String> {
        let username = self.config.username.as_deref()?;
        let password = self.config.password.as_deref().unwrap_or_default();
        Some(
            base64::engine::general_purpose::STANDARD
                .encode(format!("{username}:{password}")),
        )
    }
}

async fn read_length_prefixed(stream: &mut TcpStream) -> anyhow::Result<String> {
    let len = stream.read_u8().await? as usize;
    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes).await?;
    Ok(String::from_utf8(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(len) = stream.read(&mut buf).await {
                        if len == 0 || stream.write_all(&buf[..len]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    async fn spawn_port(config: ProxyPortConfig) -> SocketAddr {
        let listener = Arc::new(
            ProxyPortListener::bind(config, Arc::new(OutboundManager::new()))
                .await
                .unwrap(),
        );
        let addr = listener.local_addr().unwrap();
        tokio::spawn(listener.run());
        addr
    }

    fn port_config() -> ProxyPortConfig {
        ProxyPortConfig {
            listen_addr: "127.0.0.1:0".to_owned(),
            kind: ProxyPortKind::Mixed,
            enabled: true,
            outbound: String::new(),
            load_balance: LoadBalanceStrategy::default(),
            load_balance_sort: LatencySort::default(),
            username: None,
            password: None,
            allow_ips: Vec::new(),
        }
    }

    #[tokio::test]
    async fn socks5_connect_splices_to_target() {
        let echo = spawn_echo_server().await;
        let port = spawn_port(port_config()).await;

        let mut client = TcpStream::connect(port).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        let SocketAddr::V4(echo_v4) = echo else {
            panic!("expected v4 echo server");
        };
        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        request.extend_from_slice(&echo_v4.ip().octets());
        request.extend_from_slice(&echo_v4.port().to_be_bytes());
        client.write_all(&request).await.unwrap();
        let mut response = [0u8; 10];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[1], 0x00);

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
    }

    #[tokio::test]
    async fn http_connect_splices_to_target() {
        let echo = spawn_echo_server().await;
        let port = spawn_port(port_config()).await;

        let mut client = TcpStream::connect(port).await.unwrap();
        let request = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();
        let mut buf = [0u8; 39];
        client.read_exact(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf).starts_with("HTTP/1.1 200"));

        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");
    }

    #[tokio::test]
    async fn socks5_rejects_bad_credentials() {
        let mut config = port_config();
        config.username = Some("user".to_owned());
        config.password = Some("secret".to_owned());
        let port = spawn_port(config).await;

        let mut client = TcpStream::connect(port).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x02]);

        client
            .write_all(&[0x01, 0x04, b'u', b's', b'e', b'r', 0x05, b'w', b'r', b'o', b'n', b'g'])
            .await
            .unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, 0x01]);
    }
}
