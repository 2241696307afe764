//! Raw UDP proxy engine.
//!
//! Forwards datagrams byte-for-byte with just enough Raknet awareness to
//! pull the player identity out of the unencrypted Login handshake and to
//! inject a well-ordered Disconnect afterwards. The client->server
//! direction is handled by a single reader so per-session arrival order
//! is preserved; each session gets its own server->client reader.

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use raknet::conn::PacketConn;
use raknet::frame::{self, Datagram};
use raknet::message::RaknetMessage;
use raknet::GAME_PACKET_HEADER;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::acl::{self, AccessVerdict};
use crate::config::RuntimeConfigProvider;
use crate::disconnect;
use crate::engine::ping::PingResponder;
use crate::engine::{ProxyEngine, ServerStatus, SessionInfo};
use crate::login;
use crate::session::{Session, SessionRegistry, GC_INTERVAL};
use crate::Dependencies;

/// Upper bound of a relayed datagram.
const DATAGRAM_MAX: usize = 8192;
/// Cleanup task tick.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);
/// How long a kicked player's IP stays banned.
const BAN_DURATION: Duration = Duration::from_secs(300);

struct BanEntry {
    player_name: String,
    reason: String,
    expires_at: Instant,
}

pub struct RawUdpProxy {
    config_provider: Arc<RuntimeConfigProvider>,
    deps: Arc<Dependencies>,

    /// UDP socket for Player <-> Proxy traffic.
    socket: Arc<UdpSocket>,
    /// Cached port from `socket`.
    listen_port: u16,

    sessions: Arc<SessionRegistry>,
    banned: DashMap<IpAddr, BanEntry>,
    responder: PingResponder,

    closed: AtomicBool,
    stop_notify: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RawUdpProxy {
    /// Binds the engine to its configured listen address.
    pub async fn bind(
        config_provider: Arc<RuntimeConfigProvider>,
        deps: Arc<Dependencies>,
    ) -> anyhow::Result<Self> {
        let (server_id, listen_addr) = {
            let config = config_provider.read().await;
            (config.id.clone(), config.listen_addr.clone())
        };
        let socket = UdpSocket::bind(&listen_addr).await?;
        let listen_port = socket.local_addr()?.port();
        let sessions = Arc::new(SessionRegistry::new(
            server_id.clone(),
            deps.session_sink.clone(),
            deps.stats_sink.clone(),
        ));
        Ok(Self {
            config_provider,
            deps,
            socket: Arc::new(socket),
            listen_port,
            sessions,
            banned: DashMap::new(),
            responder: PingResponder::new(server_id),
            closed: AtomicBool::new(false),
            stop_notify: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn push_task(&self, task: JoinHandle<()>) {
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    /// Handles one datagram from a player.
    async fn handle_recv(self: &Arc<Self>, addr: SocketAddr, data: Bytes) -> anyhow::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        match data[0] {
            // unconnected pings never create a session
            0x01 | 0x02 => {
                let (custom_motd, show_real_latency) = {
                    let config = self.config_provider.read().await;
                    (config.custom_motd.clone(), config.show_real_latency)
                };
                self.responder
                    .handle_ping(
                        &self.socket,
                        addr,
                        &data,
                        custom_motd.as_deref(),
                        show_real_latency,
                        self.listen_port,
                    )
                    .await?;
                return Ok(());
            }
            first if first == RaknetMessage::DisconnectNotification.to_u8() => {
                if let Some(session) = self.sessions.get(&addr).await {
                    // let the remote observe the disconnect before teardown
                    if let Some(outbound) = session.outbound().await {
                        let _ = outbound.send(&data).await;
                    }
                    self.sessions.remove(&addr).await;
                    log::info!(
                        "[{}] Player {} has disconnected",
                        self.server_id().await,
                        addr
                    );
                }
                return Ok(());
            }
            _ => {}
        }

        let session = match self.sessions.get(&addr).await {
            Some(session) => {
                // a kicked session is torn down on its next datagram
                if session.kicked.load(Ordering::Acquire) {
                    self.sessions.remove(&addr).await;
                    return Ok(());
                }
                session
            }
            None => {
                // the ban window wins over everything for session creation
                if self.is_banned(addr.ip()) {
                    return Ok(());
                }
                match self.open_session(addr).await? {
                    Some(session) => session,
                    None => return Ok(()),
                }
            }
        };

        session.bytes_up.fetch_add(data.len() as u64, Ordering::Relaxed);
        session.packets.fetch_add(1, Ordering::Relaxed);
        session.touch();

        if !session.login_parsed.load(Ordering::Acquire) && frame::is_reliable_frame(data[0]) {
            if self.inspect_for_login(&session, &data).await? {
                // refused at login: the datagram is not forwarded
                return Ok(());
            }
        }

        if let Some(outbound) = session.outbound().await {
            if let Err(err) = outbound.send(&data).await {
                log::debug!(
                    "[player: {} -> server] Unable to forward data: {:?}",
                    addr,
                    err
                );
            }
        }
        Ok(())
    }

    /// Creates the session and its outbound on a client's first datagram.
    async fn open_session(self: &Arc<Self>, addr: SocketAddr) -> anyhow::Result<Option<Arc<Session>>> {
        let config = {
            let config = self.config_provider.read().await;
            config.clone()
        };
        let (session, created) = self.sessions.get_or_create(addr).await;
        if !created {
            return Ok(Some(session));
        }
        let dialed = self
            .deps
            .outbounds
            .dial_packet_with_failover(
                &config.id,
                &config.proxy_outbound,
                config.load_balance,
                config.load_balance_sort,
                &config.target_addr(),
            )
            .await;
        let (outbound, node) = match dialed {
            Ok(dialed) => dialed,
            Err(err) => {
                log::warn!(
                    "[{}] Could not open outbound for {}: {}",
                    config.id,
                    addr,
                    err
                );
                let message = acl::outbound_failure_message(
                    &config.target_addr(),
                    "direct",
                    &err.to_string(),
                );
                self.refuse_session(session, message, None).await;
                return Ok(None);
            }
        };
        session.set_outbound(outbound.clone()).await;
        log::debug!(
            "[{}] Client initialized: {} <-> {} (via {}) | {} total",
            config.id,
            addr,
            config.target_addr(),
            node.as_deref().unwrap_or("direct"),
            self.sessions.len().await
        );
        self.push_task(tokio::spawn({
            let engine = self.clone();
            let session = session.clone();
            async move {
                engine.run_remote_loop(session, outbound).await;
            }
        }));
        Ok(Some(session))
    }

    /// Scans a pre-login reliability datagram for the Login packet and
    /// runs admission once found. Returns whether the player was refused.
    async fn inspect_for_login(
        self: &Arc<Self>,
        session: &Arc<Session>,
        data: &Bytes,
    ) -> anyhow::Result<bool> {
        let datagram = match Datagram::parse(data.clone()) {
            Ok(datagram) => datagram,
            Err(err) => {
                log::debug!(
                    "[{}] {}",
                    session.addr,
                    crate::ProxyError::MalformedDatagram(format!("{:?}", err))
                );
                return Ok(false);
            }
        };
        let mut game_packets: Vec<Bytes> = Vec::new();
        for parsed in datagram.frames() {
            let Ok(parsed) = parsed else {
                break;
            };
            let body = match &parsed.split {
                Some(split) => {
                    let assembled = {
                        let mut splits = match session.splits.lock() {
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
            if body.first() == Some(&GAME_PACKET_HEADER) {
                game_packets.push(body);
            }
        }
        for body in game_packets {
            let Some(info) = login::parse_game_packet(&body) else {
                continue;
            };
            let config = {
                let config = self.config_provider.read().await;
                config.clone()
            };
            session
                .login_compression
                .store(info.compression.to_id(), Ordering::Release);
            session.set_identity(info.identity.clone());
            log::info!(
                "[{}] Player {} ({}) logging in from {} (protocol {})",
                config.id,
                info.identity.display_name,
                info.identity.xuid,
                session.addr,
                info.protocol_version
            );
            if config.disabled {
                let message = acl::disabled_message(config.disabled_message.as_deref());
                self.refuse_session(session.clone(), message, None).await;
                return Ok(true);
            }
            let verdict = acl::evaluate_access(
                self.deps.oracle.as_ref(),
                self.deps.verifier.as_deref(),
                &info.identity,
                &config.id,
                session.addr.ip(),
            )
            .await;
            if let AccessVerdict::Deny { message } = verdict {
                log::info!(
                    "[{}] Refusing {} ({}): access denied",
                    config.id,
                    info.identity.display_name,
                    session.addr
                );
                self.refuse_session(session.clone(), message, Some("access denied".to_owned()))
                    .await;
                return Ok(true);
            }
            break;
        }
        Ok(false)
    }

    /// Kicks a session: removes it immediately, optionally bans the IP,
    /// and delivers the disconnect sequence in the background.
    async fn refuse_session(&self, session: Arc<Session>, message: String, ban_reason: Option<String>) {
        session.kicked.store(true, Ordering::Release);
        if session.encrypted.load(Ordering::Acquire) {
            log::warn!(
                "[{}] Session {}: {}",
                session.server_id,
                session.addr,
                crate::ProxyError::EncryptedKickUnsupported
            );
        }
        if let Some(reason) = ban_reason {
            let player_name = session
                .identity()
                .map(|identity| identity.display_name.clone())
                .unwrap_or_default();
            self.banned.insert(
                session.addr.ip(),
                BanEntry {
                    player_name,
                    reason,
                    expires_at: Instant::now() + BAN_DURATION,
                },
            );
        }
        self.sessions.remove(&session.addr).await;
        self.push_task(tokio::spawn({
            let socket = self.socket.clone();
            async move {
                send_disconnect_sequence(&socket, &session, &message).await;
            }
        }));
    }

    /// Per-session server->client loop.
    async fn run_remote_loop(&self, session: Arc<Session>, outbound: Arc<dyn PacketConn>) {
        let mut buf = [0u8; DATAGRAM_MAX];
        loop {
            if self.closed.load(Ordering::Acquire) || session.kicked.load(Ordering::Acquire) {
                break;
            }
            tokio::select! {
                _ = session.close_notify.notified() => break,
                _ = self.stop_notify.notified() => break,
                res = tokio::time::timeout(Duration::from_secs(2), outbound.recv(&mut buf)) => {
                    let len = match res {
                        // timeouts only pace the loop; idleness is the GC's call
                        Err(_) => continue,
                        Ok(Err(err)) => {
                            log::debug!(
                                "[server -> player {}] Read failed: {:?}",
                                session.addr,
                                err
                            );
                            break;
                        }
                        Ok(Ok(len)) => len,
                    };
                    let data = &buf[..len];
                    if let Err(err) = self.socket.send_to(data, session.addr).await {
                        log::debug!(
                            "[server -> player {}] Unable to forward data: {:?}",
                            session.addr,
                            err
                        );
                    }
                    session.bytes_down.fetch_add(len as u64, Ordering::Relaxed);
                    session.touch();
                    self.observe_remote_datagram(&session, data);
                }
            }
        }
        if !self.closed.load(Ordering::Acquire) {
            self.sessions.remove(&session.addr).await;
        }
    }

    /// Tracks the remote's send state so injected frames stay well
    /// ordered, and flags encryption once it starts.
    fn observe_remote_datagram(&self, session: &Session, data: &[u8]) {
        // acks carry the valid bit too and must not advance the send state
        if data.is_empty() || !frame::is_reliable_frame(data[0]) {
            return;
        }
        let Ok(datagram) = Datagram::parse(Bytes::copy_from_slice(data)) else {
            return;
        };
        let sequence = datagram.sequence;
        let mut max_message_index = 0;
        let mut max_order_index = 0;
        let login_parsed = session.login_parsed.load(Ordering::Acquire);
        for parsed in datagram.frames() {
            let Ok(parsed) = parsed else {
                break;
            };
            max_message_index = max_message_index.max(parsed.message_index);
            max_order_index = max_order_index.max(parsed.order_index);
            if login_parsed
                && parsed.split.is_none()
                && parsed.body.first() == Some(&GAME_PACKET_HEADER)
                && parsed
                    .body
                    .get(1)
                    .is_some_and(|id| login::Compression::from_id(*id).is_none())
            {
                session.encrypted.store(true, Ordering::Release);
            }
        }
        session.observe_send_state(sequence, max_message_index, max_order_index);
    }

    fn is_banned(&self, ip: IpAddr) -> bool {
        match self.banned.get(&ip) {
            Some(entry) if entry.expires_at > Instant::now() => {
                log::trace!(
                    "Dropping datagram from banned ip {} ({}: {})",
                    ip,
                    entry.player_name,
                    entry.reason
                );
                true
            }
            Some(_) => {
                drop(self.banned.remove(&ip));
                false
            }
            None => false,
        }
    }

    async fn server_id(&self) -> String {
        self.config_provider.read().await.id.clone()
    }

    /// Periodic maintenance: split/rate-limit/ban sweeps every tick,
    /// session GC on the 30 second boundary, advertisement refresh.
    async fn run_cleanup(&self) {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        let mut ticks: u64 = 0;
        loop {
            tokio::select! {
                _ = self.stop_notify.notified() => return,
                _ = interval.tick() => {}
            }
            ticks += 1;
            let now = std::time::Instant::now();
            for session in self.sessions.all().await {
                let mut splits = match session.splits.lock() {
                    Ok(splits) => splits,
                    Err(poisoned) => poisoned.into_inner(),
                };
                splits.sweep(now);
            }
            self.responder.gc_rate_limits();
            self.banned.retain(|_, entry| entry.expires_at > Instant::now());

            let config = {
                let config = self.config_provider.read().await;
                config.clone()
            };
            if config.custom_motd.is_none() || config.show_real_latency {
                self.responder.maybe_refresh(&config.target_addr()).await;
            }
            if ticks % (GC_INTERVAL.as_secs() / CLEANUP_INTERVAL.as_secs()).max(1) == 0 {
                let idle_timeout = {
                    let global = self.config_provider.global().await;
                    config.idle_timeout(&global)
                };
                let reclaimed = self.sessions.gc(idle_timeout).await;
                if reclaimed > 0 {
                    log::debug!("[{}] Reclaimed {} idle sessions", config.id, reclaimed);
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl ProxyEngine for RawUdpProxy {
    async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        log::debug!(
            "Starting raw UDP proxy server on {}",
            self.socket.local_addr()?
        );
        self.push_task(tokio::spawn({
            let engine = self.clone();
            async move {
                engine.run_cleanup().await;
            }
        }));

        let mut buf = [0u8; DATAGRAM_MAX];
        let mut error_backoff = Duration::from_millis(50);
        loop {
            tokio::select! {
                _ = self.stop_notify.notified() => return Ok(()),
                res = self.socket.recv_from(&mut buf) => {
                    let (len, addr) = match res {
                        Ok(received) => received,
                        Err(err) => {
                            if self.closed.load(Ordering::Acquire) {
                                return Ok(());
                            }
                            log::warn!("Listener read error, retrying: {:?}", err);
                            tokio::time::sleep(error_backoff).await;
                            error_backoff = (error_backoff * 2).min(Duration::from_secs(1));
                            continue;
                        }
                    };
                    error_backoff = Duration::from_millis(50);
                    let data = Bytes::copy_from_slice(&buf[..len]);
                    if let Err(err) = self.handle_recv(addr, data).await {
                        log::debug!(
                            "[{}] Unable to handle player -> server datagram: {:?}",
                            addr,
                            err
                        );
                    }
                }
            }
        }
    }

    async fn stop(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_notify.notify_waiters();
        self.sessions.clear().await;
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = match self.tasks.lock() {
                Ok(tasks) => tasks,
                Err(poisoned) => poisoned.into_inner(),
            };
            tasks.drain(..).collect()
        };
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(3), task).await.is_err() {
                log::debug!("A proxy task did not stop in time");
            }
        }
        log::debug!("[{}] Raw UDP engine stopped", self.server_id().await);
    }

    async fn kick_player(&self, player_name: &str, reason: &str) -> usize {
        let matching: Vec<Arc<Session>> = self
            .sessions
            .all()
            .await
            .into_iter()
            .filter(|session| {
                session.identity().is_some_and(|identity| {
                    identity.display_name.eq_ignore_ascii_case(player_name)
                })
            })
            .collect();
        let count = matching.len();
        let message = if reason.is_empty() {
            "§c您已被移出服务器".to_owned()
        } else {
            format!("§c{reason}")
        };
        for session in matching {
            self.refuse_session(session, message.clone(), Some(reason.to_owned()))
                .await;
        }
        count
    }

    async fn status(&self) -> ServerStatus {
        let config = self.config_provider.read().await;
        ServerStatus {
            server_id: config.id.clone(),
            listen_addr: config.listen_addr.clone(),
            proxy_mode: config.proxy_mode,
            running: !self.closed.load(Ordering::Acquire),
            session_count: self.sessions.len().await,
            latency_ms: self.responder.latency_ms().await,
        }
    }

    async fn active_sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .all()
            .await
            .iter()
            .map(|session| SessionInfo::of(session))
            .collect()
    }

    async fn latency_ms(&self) -> Option<i64> {
        self.responder.latency_ms().await
    }

    async fn update_config(&self, config: crate::config::ServerConfig) {
        self.config_provider.reload(config).await;
    }
}

/// The full refusal sequence: three game-level Disconnects at 50 ms
/// spacing, then 80 ms later three Raknet disconnects at 20 ms spacing.
/// UDP is lossy, hence the repeats. The session is already unlinked by
/// the time this runs.
async fn send_disconnect_sequence(socket: &UdpSocket, session: &Session, message: &str) {
    for attempt in 0..3 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let datagram = disconnect::build_injected_disconnect(session, message);
        if let Err(err) = socket.send_to(&datagram, session.addr).await {
            log::debug!(
                "Unable to send game disconnect to {}: {:?}",
                session.addr,
                err
            );
        }
    }
    tokio::time::sleep(Duration::from_millis(80)).await;
    for attempt in 0..3 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if let Err(err) = socket
            .send_to(&disconnect::raknet_disconnect_bytes(), session.addr)
            .await
        {
            log::debug!(
                "Unable to send raknet disconnect to {}: {:?}",
                session.addr,
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{AccessDecision, AccessKind, AccessOracle, AclSettings, BlacklistEntry};
    use crate::config::{GlobalConfig, LatencySort, LoadBalanceStrategy, ProxyMode, ServerConfig};
    use crate::login::tests_support::forge_login_datagram;

    struct DenyingOracle;

    #[async_trait::async_trait]
    impl AccessOracle for DenyingOracle {
        async fn check_access(
            &self,
            _player_name: &str,
            _server_id: &str,
        ) -> anyhow::Result<AccessDecision> {
            Ok(AccessDecision {
                allowed: false,
                kind: AccessKind::Blacklist,
                reason: "blacklisted".to_owned(),
                detail: "griefing".to_owned(),
            })
        }

        async fn is_blacklisted(
            &self,
            player_name: &str,
            _server_id: &str,
        ) -> anyhow::Result<Option<BlacklistEntry>> {
            Ok(Some(BlacklistEntry {
                player_name: player_name.to_owned(),
                reason: "griefing".to_owned(),
            }))
        }

        async fn get_settings(&self, _server_id: &str) -> anyhow::Result<AclSettings> {
            Ok(AclSettings::default())
        }
    }

    async fn spawn_engine(
        deps: Arc<Dependencies>,
    ) -> (Arc<RawUdpProxy>, SocketAddr, UdpSocket) {
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();
        let config = ServerConfig {
            id: "test".to_owned(),
            listen_addr: "127.0.0.1:0".to_owned(),
            target_host: "127.0.0.1".to_owned(),
            target_port: remote_addr.port(),
            proxy_mode: ProxyMode::RawUdp,
            idle_timeout_seconds: None,
            proxy_outbound: String::new(),
            load_balance: LoadBalanceStrategy::default(),
            load_balance_sort: LatencySort::default(),
            show_real_latency: false,
            custom_motd: Some("MCPE;test;712;1.21.2;0;10;1;x;Survival;1;19132;19132;".to_owned()),
            disabled: false,
            disabled_message: None,
        };
        let provider = Arc::new(RuntimeConfigProvider::new(config, GlobalConfig::default()));
        let engine = Arc::new(RawUdpProxy::bind(provider, deps).await.unwrap());
        tokio::spawn(engine.clone().run());
        let addr = engine.local_addr().unwrap();
        (engine, addr, remote)
    }

    #[tokio::test]
    async fn pre_login_datagrams_are_forwarded_unchanged() {
        let (_engine, proxy_addr, remote) = spawn_engine(Arc::new(Dependencies::minimal())).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // a non-datagram offline message and a reliable frame, in order
        let offline = vec![0x05, 0xAA, 0xBB, 0xCC];
        let framed = raknet::frame::build_reliable_ordered(3, 1, 1, &[0x09, 0x01, 0x02]);
        client.send_to(&offline, proxy_addr).await.unwrap();
        client.send_to(&framed, proxy_addr).await.unwrap();

        let mut buf = [0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &offline[..]);
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &framed[..]);
    }

    #[tokio::test]
    async fn login_identity_reaches_the_session() {
        let (engine, proxy_addr, remote) = spawn_engine(Arc::new(Dependencies::minimal())).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let login = forge_login_datagram("Alice", "u-1", "x-1");
        client.send_to(&login, proxy_addr).await.unwrap();

        // the login datagram itself is still forwarded
        let mut buf = [0u8; 4096];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &login[..]);

        let sessions = engine.active_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].player_name.as_deref(), Some("Alice"));
        assert_eq!(sessions[0].xuid.as_deref(), Some("x-1"));
        assert_eq!(sessions[0].bytes_up, login.len() as u64);
    }

    #[tokio::test]
    async fn blacklisted_login_is_refused_with_disconnects() {
        let mut deps = Dependencies::minimal();
        deps.oracle = Arc::new(DenyingOracle);
        let (engine, proxy_addr, remote) = spawn_engine(Arc::new(deps)).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let login = forge_login_datagram("Alice", "u-1", "x-1");
        client.send_to(&login, proxy_addr).await.unwrap();

        // collect the refusal sequence addressed to the client
        let mut game_disconnects = 0;
        let mut raknet_disconnects = 0;
        let mut buf = [0u8; 4096];
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while raknet_disconnects < 3 {
            let received =
                tokio::time::timeout_at(deadline, client.recv_from(&mut buf)).await;
            let Ok(Ok((len, _))) = received else {
                break;
            };
            match buf[0] {
                first if frame::is_reliable_frame(first) => {
                    // the injected frame wraps a game packet
                    assert!(len > 4);
                    game_disconnects += 1;
                }
                0x15 => raknet_disconnects += 1,
                other => panic!("unexpected refusal byte {other:#04x}"),
            }
        }
        assert_eq!(game_disconnects, 3);
        assert_eq!(raknet_disconnects, 3);

        // the login never reached the remote and the session is gone
        let mut remote_buf = [0u8; 4096];
        assert!(
            tokio::time::timeout(Duration::from_millis(300), remote.recv_from(&mut remote_buf))
                .await
                .is_err()
        );
        assert_eq!(engine.status().await.session_count, 0);

        // the ban window swallows a reconnect attempt entirely
        client.send_to(&login, proxy_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.status().await.session_count, 0);
    }

    #[tokio::test]
    async fn kick_player_counts_and_removes_sessions() {
        let (engine, proxy_addr, remote) = spawn_engine(Arc::new(Dependencies::minimal())).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let login = forge_login_datagram("Alice", "u-1", "x-1");
        client.send_to(&login, proxy_addr).await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = tokio::time::timeout(Duration::from_secs(2), remote.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(engine.kick_player("ALICE", "testing").await, 1);
        assert_eq!(engine.status().await.session_count, 0);
        assert_eq!(engine.kick_player("ALICE", "testing").await, 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (engine, _, _) = spawn_engine(Arc::new(Dependencies::minimal())).await;
        engine.stop().await;
        engine.stop().await;
        assert!(!engine.status().await.running);
    }
}
