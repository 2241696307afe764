//! Outbound connection management.
//!
//! An outbound node is a tunnel endpoint traffic can be routed through.
//! Transport providers (shadowsocks, vmess, ...) plug in behind the
//! [`OutboundTransport`] trait; only the direct transport ships with the
//! core. Node health is tracked here, selection lives in [`balancer`].

pub mod balancer;
mod direct;

pub use direct::DirectTransport;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime},
};

use raknet::conn::PacketConn;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::LatencySort;

/// Transport protocol of an outbound node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundProtocol {
    Direct,
    Shadowsocks,
    Vmess,
    Trojan,
    Vless,
    Anytls,
    Hysteria2,
}

/// Immutable configuration of an outbound node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    /// Node name, unique across the manager.
    pub name: String,
    /// Group the node belongs to; empty means ungrouped.
    #[serde(default)]
    pub group: String,
    pub protocol: OutboundProtocol,
    /// Tunnel server `host:port`. Port-hopping transports accept a
    /// `host:start-end` port range.
    pub address: String,
    /// Free-form transport options (credentials, SNI, ...).
    #[serde(default)]
    pub options: HashMap<String, String>,
}

/// A `host:start-end` address split into its parts.
pub struct PortRange {
    pub host: String,
    pub start: u16,
    pub end: u16,
}

/// Parses the port-hopping `host:start-end` syntax. A plain `host:port`
/// yields a single-port range.
pub fn parse_port_range(address: &str) -> Option<PortRange> {
    let (host, ports) = address.rsplit_once(':')?;
    let (start, end) = match ports.split_once('-') {
        Some((start, end)) => (start.parse().ok()?, end.parse().ok()?),
        None => {
            let port: u16 = ports.parse().ok()?;
            (port, port)
        }
    };
    if start > end || host.is_empty() {
        return None;
    }
    Some(PortRange {
        host: host.to_owned(),
        start,
        end,
    })
}

/// Mutable health state of a node.
#[derive(Debug, Clone, Default)]
pub struct NodeHealth {
    /// Whether the node is usable for selection.
    pub healthy: bool,
    /// Whether the node was ever healthy.
    pub ever_healthy: bool,
    /// Consecutive failed checks.
    pub failed_attempts: usize,
    pub last_check: Option<SystemTime>,
    pub last_error: Option<String>,
    /// Latency samples in milliseconds; 0 or below means unmeasured.
    pub tcp_latency_ms: i64,
    pub http_latency_ms: i64,
    pub udp_latency_ms: i64,
}

impl NodeHealth {
    pub fn latency(&self, sort: LatencySort) -> i64 {
        match sort {
            LatencySort::Udp => self.udp_latency_ms,
            LatencySort::Tcp => self.tcp_latency_ms,
            LatencySort::Http => self.http_latency_ms,
        }
    }
}

/// An outbound node: immutable config plus mutable health.
#[derive(Debug)]
pub struct OutboundNode {
    /// Unique ID (not persistent across restart).
    pub uid: Uuid,
    pub config: OutboundConfig,
    pub health: RwLock<NodeHealth>,
    pub active_conns: AtomicUsize,
}

impl OutboundNode {
    fn new(config: OutboundConfig) -> Self {
        Self {
            uid: Uuid::new_v4(),
            config,
            // nodes start healthy until a check says otherwise
            health: RwLock::new(NodeHealth {
                healthy: true,
                ..Default::default()
            }),
            active_conns: AtomicUsize::new(0),
        }
    }

    pub async fn is_healthy(&self) -> bool {
        self.health.read().await.healthy
    }
}

/// Byte stream to a target, through a tunnel or direct.
pub trait OutboundStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> OutboundStream for T {}

/// A tunnel provider. Implementations dial targets through their
/// protocol; the core only ships [`DirectTransport`].
#[async_trait::async_trait]
pub trait OutboundTransport: Send + Sync {
    async fn dial_packet(
        &self,
        node: &OutboundConfig,
        target: &str,
    ) -> anyhow::Result<Arc<dyn PacketConn>>;

    async fn dial_stream(
        &self,
        node: &OutboundConfig,
        target: &str,
    ) -> anyhow::Result<Box<dyn OutboundStream>>;
}

/// Decrements a node's active connection count when dropped.
#[derive(Debug)]
pub struct ConnGuard(Arc<OutboundNode>);

impl ConnGuard {
    fn new(node: Arc<OutboundNode>) -> Self {
        node.active_conns.fetch_add(1, Ordering::AcqRel);
        Self(node)
    }

    pub fn node(&self) -> &Arc<OutboundNode> {
        &self.0
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.active_conns.fetch_sub(1, Ordering::AcqRel);
    }
}

/// [`PacketConn`] wrapper that keeps the node's connection count honest.
#[derive(Debug)]
pub struct CountedPacketConn {
    inner: Arc<dyn PacketConn>,
    _guard: ConnGuard,
}

#[async_trait::async_trait]
impl PacketConn for CountedPacketConn {
    async fn send(&self, data: &[u8]) -> std::io::Result<()> {
        self.inner.send(data).await
    }

    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.recv(buf).await
    }
}

pub(crate) type RoundRobinState = Mutex<HashMap<String, (u64, usize)>>;

/// Registry of outbound nodes and their transports.
pub struct OutboundManager {
    nodes: RwLock<Vec<Arc<OutboundNode>>>,
    transports: RwLock<HashMap<OutboundProtocol, Arc<dyn OutboundTransport>>>,
    direct: Arc<DirectTransport>,
    /// Round-robin rotation state, keyed by the caller's group key.
    pub(crate) round_robin: RoundRobinState,
}

impl Default for OutboundManager {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundManager {
    pub fn new() -> Self {
        let direct = Arc::new(DirectTransport);
        let mut transports: HashMap<OutboundProtocol, Arc<dyn OutboundTransport>> = HashMap::new();
        transports.insert(OutboundProtocol::Direct, direct.clone());
        Self {
            nodes: RwLock::new(Vec::new()),
            transports: RwLock::new(transports),
            direct,
            round_robin: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a transport provider for a protocol.
    pub async fn register_transport(
        &self,
        protocol: OutboundProtocol,
        transport: Arc<dyn OutboundTransport>,
    ) {
        let mut transports = self.transports.write().await;
        transports.insert(protocol, transport);
    }

    pub async fn add_outbound(&self, config: OutboundConfig) -> anyhow::Result<()> {
        let mut nodes = self.nodes.write().await;
        if nodes.iter().any(|node| node.config.name == config.name) {
            return Err(anyhow::anyhow!("outbound {} already exists", config.name));
        }
        log::info!("Registered outbound node {} ({:?})", config.name, config.protocol);
        nodes.push(Arc::new(OutboundNode::new(config)));
        Ok(())
    }

    /// Replaces a node's configuration, resetting its health.
    pub async fn update_outbound(&self, config: OutboundConfig) -> anyhow::Result<()> {
        let mut nodes = self.nodes.write().await;
        let slot = nodes
            .iter_mut()
            .find(|node| node.config.name == config.name)
            .ok_or_else(|| anyhow::anyhow!("outbound {} does not exist", config.name))?;
        *slot = Arc::new(OutboundNode::new(config));
        Ok(())
    }

    pub async fn delete_outbound(&self, name: &str) -> bool {
        let mut nodes = self.nodes.write().await;
        let before = nodes.len();
        nodes.retain(|node| node.config.name != name);
        before != nodes.len()
    }

    pub async fn get_node(&self, name: &str) -> Option<Arc<OutboundNode>> {
        let nodes = self.nodes.read().await;
        nodes.iter().find(|node| node.config.name == name).cloned()
    }

    pub async fn nodes(&self) -> Vec<Arc<OutboundNode>> {
        self.nodes.read().await.clone()
    }

    pub async fn get_health_status(&self, name: &str) -> Option<NodeHealth> {
        let node = self.get_node(name).await?;
        let health = node.health.read().await;
        Some(health.clone())
    }

    async fn transport_for(
        &self,
        protocol: OutboundProtocol,
    ) -> anyhow::Result<Arc<dyn OutboundTransport>> {
        let transports = self.transports.read().await;
        transports.get(&protocol).cloned().ok_or_else(|| {
            anyhow::anyhow!("no transport provider registered for {:?}", protocol)
        })
    }

    /// Dials a packet-oriented connection to `target` through a node.
    pub async fn dial_packet_conn(
        &self,
        node_name: &str,
        target: &str,
    ) -> anyhow::Result<Arc<dyn PacketConn>> {
        let node = self
            .get_node(node_name)
            .await
            .ok_or_else(|| anyhow::anyhow!("outbound {} does not exist", node_name))?;
        let transport = self.transport_for(node.config.protocol).await?;
        let inner = transport.dial_packet(&node.config, target).await?;
        Ok(Arc::new(CountedPacketConn {
            inner,
            _guard: ConnGuard::new(node),
        }))
    }

    /// Dials a byte stream to `target` through a node.
    pub async fn dial_stream(
        &self,
        node_name: &str,
        target: &str,
    ) -> anyhow::Result<(Box<dyn OutboundStream>, ConnGuard)> {
        let node = self
            .get_node(node_name)
            .await
            .ok_or_else(|| anyhow::anyhow!("outbound {} does not exist", node_name))?;
        let transport = self.transport_for(node.config.protocol).await?;
        let stream = transport.dial_stream(&node.config, target).await?;
        Ok((stream, ConnGuard::new(node)))
    }

    /// Dials `target` without any tunnel.
    pub async fn dial_packet_direct(&self, target: &str) -> anyhow::Result<Arc<dyn PacketConn>> {
        let config = OutboundConfig {
            name: String::new(),
            group: String::new(),
            protocol: OutboundProtocol::Direct,
            address: String::new(),
            options: HashMap::new(),
        };
        self.direct.dial_packet(&config, target).await
    }

    /// Runs one health check for a node: a timed TCP connect to its
    /// address. Three consecutive failures mark a previously healthy
    /// node unhealthy.
    pub async fn check_health(&self, node: &Arc<OutboundNode>) {
        let address = node.config.address.clone();
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            tokio::net::TcpStream::connect(resolve_single_port(&address)),
        )
        .await;
        let elapsed_ms = started.elapsed().as_millis() as i64;
        let mut health = node.health.write().await;
        let prev_healthy = health.healthy;
        health.last_check = Some(SystemTime::now());
        match result {
            Ok(Ok(_)) => {
                health.failed_attempts = 0;
                health.healthy = true;
                health.ever_healthy = true;
                health.tcp_latency_ms = elapsed_ms.max(1);
                health.last_error = None;
            }
            Ok(Err(err)) => {
                health.failed_attempts += 1;
                health.healthy = health.ever_healthy && health.failed_attempts < 3;
                health.last_error = Some(err.to_string());
            }
            Err(_) => {
                health.failed_attempts += 1;
                health.healthy = health.ever_healthy && health.failed_attempts < 3;
                health.last_error = Some("connect timed out".to_owned());
            }
        }
        let healthy = health.healthy;
        drop(health);
        if prev_healthy != healthy {
            if healthy {
                log::info!("Outbound node {} is now healthy", node.config.name);
            } else {
                log::warn!("Outbound node {} seems unreachable", node.config.name);
            }
        }
    }

    /// Checks every node concurrently.
    pub async fn check_all_health(self: &Arc<Self>) {
        let nodes = self.nodes().await;
        let mut join_set = JoinSet::new();
        for node in nodes {
            let manager = self.clone();
            join_set.spawn(async move {
                manager.check_health(&node).await;
            });
        }
        log::debug!("Checking health of {} outbound nodes...", join_set.len());
        while join_set.join_next().await.is_some() {}
    }

    /// Records a latency sample measured opportunistically by an engine.
    pub async fn record_latency(&self, node_name: &str, sort: LatencySort, latency_ms: i64) {
        let Some(node) = self.get_node(node_name).await else {
            return;
        };
        let mut health = node.health.write().await;
        match sort {
            LatencySort::Udp => health.udp_latency_ms = latency_ms,
            LatencySort::Tcp => health.tcp_latency_ms = latency_ms,
            LatencySort::Http => health.http_latency_ms = latency_ms,
        }
    }

    /// Records a dial failure against a node.
    pub async fn mark_dial_failure(&self, node: &Arc<OutboundNode>, err: &anyhow::Error) {
        let mut health = node.health.write().await;
        health.failed_attempts += 1;
        health.last_error = Some(err.to_string());
    }
}

/// Collapses a potential port range onto its first port for checks that
/// need a single endpoint.
fn resolve_single_port(address: &str) -> String {
    match parse_port_range(address) {
        Some(range) => format!("{}:{}", range.host, range.start),
        None => address.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_syntax() {
        let range = parse_port_range("example.com:2000-3000").unwrap();
        assert_eq!(range.host, "example.com");
        assert_eq!((range.start, range.end), (2000, 3000));

        let single = parse_port_range("10.0.0.1:443").unwrap();
        assert_eq!((single.start, single.end), (443, 443));

        assert!(parse_port_range("no-port").is_none());
        assert!(parse_port_range("host:30-20").is_none());
    }

    #[tokio::test]
    async fn add_update_delete_outbound() {
        let manager = OutboundManager::new();
        let config = OutboundConfig {
            name: "a".to_owned(),
            group: "eu".to_owned(),
            protocol: OutboundProtocol::Direct,
            address: "10.0.0.1:443".to_owned(),
            options: HashMap::new(),
        };
        manager.add_outbound(config.clone()).await.unwrap();
        assert!(manager.add_outbound(config.clone()).await.is_err());
        assert!(manager.get_node("a").await.is_some());
        manager.update_outbound(config).await.unwrap();
        assert!(manager.delete_outbound("a").await);
        assert!(!manager.delete_outbound("a").await);
    }

    #[tokio::test]
    async fn unregistered_transport_is_an_error() {
        let manager = OutboundManager::new();
        manager
            .add_outbound(OutboundConfig {
                name: "hy2".to_owned(),
                group: String::new(),
                protocol: OutboundProtocol::Hysteria2,
                address: "example.com:5000-6000".to_owned(),
                options: HashMap::new(),
            })
            .await
            .unwrap();
        let err = manager
            .dial_packet_conn("hy2", "127.0.0.1:19132")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no transport provider"));
    }
}
