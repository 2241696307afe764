use std::path::Path;

use serde::{Deserialize, Serialize};
use warden_core::config::{GlobalConfig, ServerConfig};
use warden_core::outbound::OutboundConfig;
use warden_core::proxy_port::ProxyPortConfig;

/// Configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootConfig {
    /// Proxy-wide settings.
    #[serde(flatten)]
    pub global: GlobalConfig,

    /// Servers to proxy.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Outbound tunnel nodes.
    #[serde(default)]
    pub outbounds: Vec<OutboundConfig>,

    /// Generic local proxy ports.
    #[serde(default)]
    pub proxy_ports: Vec<ProxyPortConfig>,

    /// Static access control lists.
    #[serde(default)]
    pub acl: AclConfig,
}

/// File-backed access control lists. A deployment with a database keeps
/// these empty and wires its own oracle instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AclConfig {
    #[serde(default)]
    pub whitelist_enabled: bool,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<BlacklistConfigEntry>,
    #[serde(default)]
    pub whitelist_message: Option<String>,
    #[serde(default)]
    pub default_ban_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistConfigEntry {
    pub name: String,
    #[serde(default)]
    pub reason: String,
}

/// Reads the configuration file.
///
/// ## Arguments
///
/// * `config_file` - Config file path
pub async fn read_config<P: AsRef<Path>>(config_file: P) -> anyhow::Result<RootConfig> {
    let contents = tokio::fs::read_to_string(config_file).await?;
    let config: RootConfig = toml::from_str(&contents)?;
    let mut seen = std::collections::HashSet::new();
    for server in &config.servers {
        if !seen.insert(server.id.clone()) {
            return Err(anyhow::anyhow!("duplicate server id {:?}", server.id));
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::config::ProxyMode;

    #[test]
    fn parses_a_full_config() {
        let raw = r#"
proxy_ports_enabled = true
passthrough_idle_timeout_override = 30

[[servers]]
id = "lobby"
listen_addr = "0.0.0.0:19132"
target_host = "play.example.com"
target_port = 19132
proxy_mode = "passthrough"
proxy_outbound = "@asia"
load_balance = "least_latency"
load_balance_sort = "udp"
show_real_latency = true

[[servers]]
id = "survival"
listen_addr = "0.0.0.0:19133"
target_host = "10.0.0.2"
target_port = 19132

[[outbounds]]
name = "tokyo-1"
group = "asia"
protocol = "hysteria2"
address = "tokyo.example.com:5000-6000"

[[proxy_ports]]
listen_addr = "127.0.0.1:1080"
kind = "mixed"
enabled = true
username = "user"
password = "secret"

[acl]
whitelist_enabled = true
whitelist = ["Alice"]
blacklist = [{ name = "Griefer", reason = "griefing" }]
"#;
        let config: RootConfig = toml::from_str(raw).unwrap();
        assert!(config.global.proxy_ports_enabled);
        assert_eq!(config.global.passthrough_idle_timeout_override, Some(30));
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].proxy_mode, ProxyMode::Passthrough);
        assert_eq!(config.servers[1].proxy_mode, ProxyMode::RawUdp);
        assert_eq!(config.outbounds[0].group, "asia");
        assert_eq!(config.proxy_ports.len(), 1);
        assert!(config.acl.whitelist_enabled);
        assert_eq!(config.acl.blacklist[0].reason, "griefing");
    }
}
