use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock, RwLockReadGuard};

/// How a proxied server handles traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    /// Byte-for-byte UDP forwarding with Login inspection.
    RawUdp,
    /// Terminate Raknet, replay the handshake against the remote.
    Passthrough,
    /// Alias of [`ProxyMode::RawUdp`].
    Transparent,
    /// Alias of [`ProxyMode::RawUdp`].
    Raknet,
}

impl ProxyMode {
    /// Collapses the alias modes onto the engine actually used.
    pub fn effective(self) -> ProxyMode {
        match self {
            Self::Passthrough => Self::Passthrough,
            other => {
                if !matches!(other, Self::RawUdp) {
                    log::debug!("Proxy mode {:?} is handled by the raw UDP engine", other);
                }
                Self::RawUdp
            }
        }
    }
}

/// Load balancing strategy over outbound nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// Pick the node with the smallest measured latency.
    #[default]
    LeastLatency,
    /// Pick each node in turn.
    RoundRobin,
    /// Uniform random pick.
    Random,
    /// Pick the node with the fewest active connections.
    LeastConnections,
}

/// Which latency sample least-latency sorts by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencySort {
    #[default]
    Udp,
    Tcp,
    Http,
}

/// Configuration for one proxied server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server ID, unique across the proxy.
    pub id: String,
    /// Address to listen on for player traffic.
    pub listen_addr: String,
    /// Remote server host.
    pub target_host: String,
    /// Remote server port.
    pub target_port: u16,
    /// Traffic handling mode.
    #[serde(default = "default_proxy_mode")]
    pub proxy_mode: ProxyMode,
    /// Seconds without traffic before a session is reclaimed.
    #[serde(default)]
    pub idle_timeout_seconds: Option<u64>,
    /// Outbound selector; empty means a direct connection.
    #[serde(default)]
    pub proxy_outbound: String,
    /// Load balancing strategy over the selected nodes.
    #[serde(default)]
    pub load_balance: LoadBalanceStrategy,
    /// Latency sample used by least-latency.
    #[serde(default)]
    pub load_balance_sort: LatencySort,
    /// Whether to embed the measured latency into the MOTD.
    #[serde(default)]
    pub show_real_latency: bool,
    /// Custom MOTD advertisement; when unset the remote's is cached.
    #[serde(default)]
    pub custom_motd: Option<String>,
    /// Whether the server refuses new players.
    #[serde(default)]
    pub disabled: bool,
    /// Message shown when the server is disabled.
    #[serde(default)]
    pub disabled_message: Option<String>,
}

impl ServerConfig {
    pub fn target_addr(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }

    /// Effective idle timeout, honoring the 30 second floor and the
    /// passthrough-compat default.
    pub fn idle_timeout(&self, global: &GlobalConfig) -> std::time::Duration {
        let default_secs = match self.proxy_mode.effective() {
            ProxyMode::Passthrough => global.passthrough_idle_timeout_override.unwrap_or(30),
            _ => 300,
        };
        let secs = self.idle_timeout_seconds.unwrap_or(default_secs).max(30);
        std::time::Duration::from_secs(secs)
    }
}

fn default_proxy_mode() -> ProxyMode {
    ProxyMode::RawUdp
}

/// Proxy-wide settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Overrides the default idle timeout of passthrough sessions.
    #[serde(default)]
    pub passthrough_idle_timeout_override: Option<u64>,
    /// Master switch for the generic proxy ports.
    #[serde(default)]
    pub proxy_ports_enabled: bool,
}

/// As a [`ServerConfig`] may be updated by reloads, engines read it
/// through this provider. Hot-path fields are re-read per iteration.
pub struct RuntimeConfigProvider {
    /// Last config.
    config: RwLock<ServerConfig>,
    /// Proxy-wide settings.
    global: RwLock<GlobalConfig>,
    /// Reload notifier.
    reload_notify: Notify,
}

impl RuntimeConfigProvider {
    pub fn new(initial: ServerConfig, global: GlobalConfig) -> Self {
        Self {
            config: RwLock::new(initial),
            global: RwLock::new(global),
            reload_notify: Notify::new(),
        }
    }

    #[inline]
    pub async fn read(&self) -> RwLockReadGuard<'_, ServerConfig> {
        self.config.read().await
    }

    #[inline]
    pub async fn global(&self) -> RwLockReadGuard<'_, GlobalConfig> {
        self.global.read().await
    }

    #[inline]
    pub async fn wait_reload(&self) {
        self.reload_notify.notified().await;
    }

    /// Replaces the configuration. Safe to call while engines forward.
    pub async fn reload(&self, config: ServerConfig) {
        let mut w = self.config.write().await;
        *w = config;
        drop(w);
        self.reload_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(mode: ProxyMode) -> ServerConfig {
        ServerConfig {
            id: "s1".to_owned(),
            listen_addr: "127.0.0.1:19132".to_owned(),
            target_host: "127.0.0.1".to_owned(),
            target_port: 20000,
            proxy_mode: mode,
            idle_timeout_seconds: None,
            proxy_outbound: String::new(),
            load_balance: LoadBalanceStrategy::default(),
            load_balance_sort: LatencySort::default(),
            show_real_latency: false,
            custom_motd: None,
            disabled: false,
            disabled_message: None,
        }
    }

    #[test]
    fn alias_modes_collapse_to_raw_udp() {
        assert_eq!(ProxyMode::Transparent.effective(), ProxyMode::RawUdp);
        assert_eq!(ProxyMode::Raknet.effective(), ProxyMode::RawUdp);
        assert_eq!(ProxyMode::Passthrough.effective(), ProxyMode::Passthrough);
    }

    #[test]
    fn idle_timeout_floor_and_defaults() {
        let global = GlobalConfig::default();
        assert_eq!(
            server(ProxyMode::RawUdp).idle_timeout(&global).as_secs(),
            300
        );
        assert_eq!(
            server(ProxyMode::Passthrough)
                .idle_timeout(&global)
                .as_secs(),
            30
        );
        let mut low = server(ProxyMode::RawUdp);
        low.idle_timeout_seconds = Some(5);
        assert_eq!(low.idle_timeout(&global).as_secs(), 30);
    }
}
