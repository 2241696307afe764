//! Proxy engines and the server manager.
//!
//! One engine instance serves one configured server. The manager owns the
//! engine factory (keeping the raw-UDP/passthrough split out of either
//! engine) and exposes the control surface the admin layer consumes.

pub mod passthrough;
pub mod ping;
pub mod raw_udp;

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{GlobalConfig, ProxyMode, RuntimeConfigProvider, ServerConfig};
use crate::session::Session;
use crate::Dependencies;

/// Control surface every engine implements.
#[async_trait::async_trait]
pub trait ProxyEngine: Send + Sync {
    /// Runs the engine until stopped.
    async fn run(self: Arc<Self>) -> anyhow::Result<()>;

    /// Stops the engine, tearing down every session. Idempotent.
    async fn stop(&self);

    /// Kicks every session whose player name matches, case-insensitively.
    /// Returns the number of sessions terminated.
    async fn kick_player(&self, player_name: &str, reason: &str) -> usize;

    async fn status(&self) -> ServerStatus;

    async fn active_sessions(&self) -> Vec<SessionInfo>;

    /// Last measured latency to the remote, if known.
    async fn latency_ms(&self) -> Option<i64>;

    /// Swaps the config snapshot. Safe while forwarding.
    async fn update_config(&self, config: ServerConfig);
}

/// Point-in-time engine state for the admin surface.
#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub server_id: String,
    pub listen_addr: String,
    pub proxy_mode: ProxyMode,
    pub running: bool,
    pub session_count: usize,
    pub latency_ms: Option<i64>,
}

/// Point-in-time session state for the admin surface.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Uuid,
    pub addr: SocketAddr,
    pub player_name: Option<String>,
    pub xuid: Option<String>,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub duration: Duration,
}

impl SessionInfo {
    pub fn of(session: &Session) -> Self {
        Self {
            id: session.id,
            addr: session.addr,
            player_name: session
                .identity()
                .map(|identity| identity.display_name.clone()),
            xuid: session.identity().map(|identity| identity.xuid.clone()),
            bytes_up: session
                .bytes_up
                .load(std::sync::atomic::Ordering::Relaxed),
            bytes_down: session
                .bytes_down
                .load(std::sync::atomic::Ordering::Relaxed),
            duration: session.started_at.elapsed().unwrap_or_default(),
        }
    }
}

struct ManagedServer {
    engine: Arc<dyn ProxyEngine>,
    task: JoinHandle<()>,
}

/// Owns the engines of every configured server.
pub struct ServerManager {
    deps: Arc<Dependencies>,
    global: GlobalConfig,
    servers: RwLock<HashMap<String, ManagedServer>>,
}

impl ServerManager {
    pub fn new(deps: Arc<Dependencies>, global: GlobalConfig) -> Self {
        Self {
            deps,
            global,
            servers: RwLock::new(HashMap::new()),
        }
    }

    /// Builds and starts the engine for a server config.
    pub async fn start_server(&self, config: ServerConfig) -> anyhow::Result<()> {
        let server_id = config.id.clone();
        {
            let servers = self.servers.read().await;
            if servers.contains_key(&server_id) {
                return Err(anyhow::anyhow!("server {} is already running", server_id));
            }
        }
        let provider = Arc::new(RuntimeConfigProvider::new(
            config.clone(),
            self.global.clone(),
        ));
        let engine: Arc<dyn ProxyEngine> = match config.proxy_mode.effective() {
            ProxyMode::Passthrough => {
                Arc::new(
                    passthrough::PassthroughProxy::bind(provider, self.deps.clone()).await?,
                )
            }
            _ => Arc::new(raw_udp::RawUdpProxy::bind(provider, self.deps.clone()).await?),
        };
        let task = tokio::spawn({
            let engine = engine.clone();
            let server_id = server_id.clone();
            async move {
                if let Err(err) = engine.run().await {
                    log::error!("[{}] Engine stopped with an error: {:?}", server_id, err);
                }
            }
        });
        log::info!(
            "[{}] Started {:?} proxy on {}",
            server_id,
            config.proxy_mode.effective(),
            config.listen_addr
        );
        let mut servers = self.servers.write().await;
        servers.insert(server_id, ManagedServer { engine, task });
        Ok(())
    }

    pub async fn stop_server(&self, server_id: &str) -> bool {
        let managed = {
            let mut servers = self.servers.write().await;
            servers.remove(server_id)
        };
        match managed {
            Some(managed) => {
                managed.engine.stop().await;
                managed.task.abort();
                log::info!("[{}] Stopped proxy server", server_id);
                true
            }
            None => false,
        }
    }

    /// Applies a new config. A changed listen address needs a full
    /// restart; anything else is swapped in place.
    pub async fn reload_server(&self, config: ServerConfig) -> anyhow::Result<()> {
        let server_id = config.id.clone();
        let (listen_changed, mode_changed) = {
            let servers = self.servers.read().await;
            match servers.get(&server_id) {
                Some(managed) => {
                    let status = managed.engine.status().await;
                    (
                        status.listen_addr != config.listen_addr,
                        status.proxy_mode.effective() != config.proxy_mode.effective(),
                    )
                }
                None => return self.start_server(config).await,
            }
        };
        if listen_changed || mode_changed {
            self.stop_server(&server_id).await;
            return self.start_server(config).await;
        }
        let servers = self.servers.read().await;
        if let Some(managed) = servers.get(&server_id) {
            managed.engine.update_config(config).await;
        }
        Ok(())
    }

    /// Kicks a player across every server. Returns the total number of
    /// sessions terminated.
    pub async fn kick_player(&self, player_name: &str, reason: &str) -> usize {
        let engines: Vec<Arc<dyn ProxyEngine>> = {
            let servers = self.servers.read().await;
            servers.values().map(|managed| managed.engine.clone()).collect()
        };
        let mut count = 0;
        for engine in engines {
            count += engine.kick_player(player_name, reason).await;
        }
        count
    }

    pub async fn get_server_status(&self, server_id: &str) -> Option<ServerStatus> {
        let engine = self.engine_of(server_id).await?;
        Some(engine.status().await)
    }

    pub async fn get_all_server_statuses(&self) -> Vec<ServerStatus> {
        let engines: Vec<Arc<dyn ProxyEngine>> = {
            let servers = self.servers.read().await;
            servers.values().map(|managed| managed.engine.clone()).collect()
        };
        let mut statuses = Vec::with_capacity(engines.len());
        for engine in engines {
            statuses.push(engine.status().await);
        }
        statuses
    }

    pub async fn get_active_sessions_for_server(&self, server_id: &str) -> Vec<SessionInfo> {
        match self.engine_of(server_id).await {
            Some(engine) => engine.active_sessions().await,
            None => Vec::new(),
        }
    }

    pub async fn get_server_latency(&self, server_id: &str) -> Option<i64> {
        let engine = self.engine_of(server_id).await?;
        engine.latency_ms().await
    }

    async fn engine_of(&self, server_id: &str) -> Option<Arc<dyn ProxyEngine>> {
        let servers = self.servers.read().await;
        servers.get(server_id).map(|managed| managed.engine.clone())
    }

    /// Stops every server. Used at shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = {
            let servers = self.servers.read().await;
            servers.keys().cloned().collect()
        };
        for id in ids {
            self.stop_server(&id).await;
        }
    }
}
