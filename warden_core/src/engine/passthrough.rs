//! Passthrough proxy engine.
//!
//! Terminates Raknet on both sides and replays the game handshake: the
//! client's NetworkSettings request and Login go to the remote verbatim,
//! the remote's NetworkSettings response comes back verbatim, so the
//! client negotiates encryption directly with the remote. After the Login
//! is forwarded, both directions relay opaque game packets; nothing past
//! the handshake is ever decrypted.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use raknet::conn::{self, OfflineAction, OfflineHandshake, PacketConn, RakConn, RakRole, SharedUdpPeer};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::acl::{self, AccessVerdict};
use crate::config::RuntimeConfigProvider;
use crate::disconnect;
use crate::engine::ping::PingResponder;
use crate::engine::{ProxyEngine, ServerStatus, SessionInfo};
use crate::login::{self, Compression};
use crate::session::{Session, SessionRegistry, GC_INTERVAL};
use crate::{Dependencies, DisconnectCause};

/// Per-direction read deadline inside the relay.
const RELAY_READ_DEADLINE: Duration = Duration::from_secs(2);
/// Consecutive deadline misses before the session is considered dead.
const RELAY_MAX_TIMEOUTS: u32 = 15;
/// Deadline for the whole NetworkSettings/Login exchange.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// MTU cap offered to clients.
const MTU_CAP: u16 = 1400;
/// Cleanup task tick.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

pub struct PassthroughProxy {
    config_provider: Arc<RuntimeConfigProvider>,
    deps: Arc<Dependencies>,

    socket: Arc<UdpSocket>,
    listen_port: u16,

    sessions: Arc<SessionRegistry>,
    /// Client-side Raknet connections, fed by the listener loop.
    conns: Arc<DashMap<SocketAddr, Arc<RakConn>>>,
    responder: PingResponder,
    handshake: OfflineHandshake,

    closed: AtomicBool,
    stop_notify: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PassthroughProxy {
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
        let responder = PingResponder::new(server_id);
        let handshake = OfflineHandshake {
            server_uuid: responder.guid(),
            mtu_cap: MTU_CAP,
        };
        Ok(Self {
            config_provider,
            deps,
            socket: Arc::new(socket),
            listen_port,
            sessions,
            conns: Arc::new(DashMap::new()),
            responder,
            handshake,
            closed: AtomicBool::new(false),
            stop_notify: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn push_task(&self, task: JoinHandle<()>) {
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    async fn handle_recv(self: &Arc<Self>, addr: SocketAddr, data: Bytes) -> anyhow::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if matches!(data[0], 0x01 | 0x02) {
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
        if let Some(conn) = self.conns.get(&addr).map(|entry| entry.value().clone()) {
            conn.handle_datagram(data).await?;
            if conn.is_closed() {
                self.teardown_client(addr).await;
            }
            return Ok(());
        }
        match self.handshake.handle(&data) {
            OfflineAction::Reply(reply) => {
                self.socket.send_to(&reply, addr).await?;
            }
            OfflineAction::Establish(reply, mtu) => {
                self.socket.send_to(&reply, addr).await?;
                let transport = Arc::new(SharedUdpPeer {
                    socket: self.socket.clone(),
                    peer: addr,
                });
                let conn = RakConn::new(transport, RakRole::Server, mtu);
                self.conns.insert(addr, conn.clone());
                self.push_task(tokio::spawn({
                    let engine = self.clone();
                    async move {
                        engine.run_connection(addr, conn).await;
                        engine.teardown_client(addr).await;
                    }
                }));
            }
            OfflineAction::Ignore => {
                log::trace!("[{}] Ignoring offline message {:02x}", addr, data[0]);
            }
        }
        Ok(())
    }

    async fn teardown_client(&self, addr: SocketAddr) {
        if let Some((_, conn)) = self.conns.remove(&addr) {
            conn.mark_closed();
        }
        self.sessions.remove(&addr).await;
    }

    /// Drives one client connection: handshake replay, admission, relay.
    async fn run_connection(self: &Arc<Self>, addr: SocketAddr, client: Arc<RakConn>) {
        let config = {
            let config = self.config_provider.read().await;
            config.clone()
        };
        let (session, _) = self.sessions.get_or_create(addr).await;
        session.touch();

        let result = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            self.run_handshake(&config, &session, &client),
        )
        .await;
        let remote = match result {
            Ok(Some(remote)) => remote,
            Ok(None) => return,
            Err(_) => {
                log::debug!(
                    "[{}] {} with {}",
                    config.id,
                    crate::ProxyError::HandshakeTimeout,
                    addr
                );
                return;
            }
        };
        self.run_relay(&config.id, &session, &client, &remote).await;
        remote.disconnect().await;
        client.disconnect().await;
    }

    /// Steps 2..8 of the passthrough handshake. Returns the remote
    /// connection once the Login has been forwarded, or [`None`] when the
    /// client was refused (the refusal is already delivered).
    async fn run_handshake(
        &self,
        config: &crate::config::ServerConfig,
        session: &Arc<Session>,
        client: &Arc<RakConn>,
    ) -> Option<Arc<RakConn>> {
        // first packet is the NetworkSettings request
        let settings_request = client.next_payload().await?;
        session.touch();

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
        let (transport, node) = match dialed {
            Ok(dialed) => dialed,
            Err(err) => {
                log::warn!(
                    "[{}] Could not reach the remote for {}: {}",
                    config.id,
                    session.addr,
                    err
                );
                let message = acl::outbound_failure_message(
                    &config.target_addr(),
                    "direct",
                    &err.to_string(),
                );
                self.refuse(session, client, &message, Compression::None).await;
                return None;
            }
        };
        let remote_addr = resolve_target(&config.target_addr()).await;
        let remote = match conn::dial(transport, remote_addr, MTU_CAP).await {
            Ok(remote) => remote,
            Err(err) => {
                log::warn!(
                    "[{}] Raknet handshake with the remote failed for {}: {:?}",
                    config.id,
                    session.addr,
                    err
                );
                let message = acl::outbound_failure_message(
                    &config.target_addr(),
                    node.as_deref().unwrap_or("direct"),
                    &err.to_string(),
                );
                self.refuse(session, client, &message, Compression::None).await;
                return None;
            }
        };

        // request goes out verbatim; the response comes back verbatim so
        // the client negotiates compression with the remote directly
        if remote.send_payload(&settings_request).await.is_err() {
            return None;
        }
        let settings_response = self.recv_remote_payload(&remote).await?;
        if client.send_payload(&settings_response).await.is_err() {
            return None;
        }

        let login_packet = client.next_payload().await?;
        session.touch();
        session
            .bytes_up
            .fetch_add(login_packet.len() as u64, Ordering::Relaxed);
        if let Some(info) = login::parse_game_packet(&login_packet) {
            session
                .login_compression
                .store(info.compression.to_id(), Ordering::Release);
            log::info!(
                "[{}] Player {} ({}) logging in from {} (protocol {})",
                config.id,
                info.identity.display_name,
                info.identity.xuid,
                session.addr,
                info.protocol_version
            );

            // a fast reconnect must not trip over its stale predecessor
            self.evict_same_identity(session, &info.identity).await;
            session.set_identity(info.identity.clone());

            if config.disabled {
                let message = acl::disabled_message(config.disabled_message.as_deref());
                self.refuse(session, client, &message, info.compression).await;
                return None;
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
                self.refuse(session, client, &message, info.compression).await;
                return None;
            }
        } else {
            log::debug!(
                "[{}] No identity recognized in the login exchange with {}",
                config.id,
                session.addr
            );
        }

        if remote.send_payload(&login_packet).await.is_err() {
            return None;
        }
        Some(remote)
    }

    /// Removes any prior session with the same XUID or display name, and
    /// closes its client connection.
    async fn evict_same_identity(&self, session: &Arc<Session>, identity: &login::PlayerIdentity) {
        let mut evicted = self.sessions.remove_by_xuid(&identity.xuid).await;
        evicted.extend(
            self.sessions
                .remove_by_player_name(&identity.display_name)
                .await,
        );
        for stale in evicted {
            if stale.addr == session.addr {
                continue;
            }
            log::info!(
                "[{}] Evicting stale session {} for reconnecting player {}",
                stale.server_id,
                stale.addr,
                identity.display_name
            );
            if let Some((_, conn)) = self.conns.remove(&stale.addr) {
                conn.disconnect().await;
            }
        }
    }

    /// Delivers a refusal over the client's Raknet connection and closes
    /// it. The 100 ms pause lets the frame flush before the close.
    async fn refuse(
        &self,
        session: &Arc<Session>,
        client: &Arc<RakConn>,
        message: &str,
        compression: Compression,
    ) {
        session.kicked.store(true, Ordering::Release);
        let packet = disconnect::build_game_disconnect(message, compression);
        if let Err(err) = client.send_payload(&packet).await {
            log::debug!("Unable to deliver refusal to {}: {:?}", session.addr, err);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.disconnect().await;
    }

    /// Reads one payload from the remote, driving its transport.
    async fn recv_remote_payload(&self, remote: &Arc<RakConn>) -> Option<Bytes> {
        let mut buf = [0u8; 2048];
        loop {
            tokio::select! {
                payload = remote.next_payload() => return payload,
                res = remote.transport().recv(&mut buf) => {
                    let len = res.ok()?;
                    let data = Bytes::copy_from_slice(&buf[..len]);
                    if remote.handle_datagram(data).await.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Bidirectional relay until either side goes quiet or closes.
    async fn run_relay(
        &self,
        server_id: &str,
        session: &Arc<Session>,
        client: &Arc<RakConn>,
        remote: &Arc<RakConn>,
    ) {
        let disconnect_reason: Mutex<Option<String>> = Mutex::new(None);
        let upstream = async {
            let mut timeouts = 0u32;
            loop {
                if session.kicked.load(Ordering::Acquire) {
                    break DisconnectCause::Kicked;
                }
                match tokio::time::timeout(RELAY_READ_DEADLINE, client.next_payload()).await {
                    Err(_) => {
                        timeouts += 1;
                        if timeouts >= RELAY_MAX_TIMEOUTS {
                            break DisconnectCause::TimeoutClient;
                        }
                    }
                    Ok(None) => break DisconnectCause::Normal,
                    Ok(Some(payload)) => {
                        timeouts = 0;
                        session
                            .bytes_up
                            .fetch_add(payload.len() as u64, Ordering::Relaxed);
                        session.packets.fetch_add(1, Ordering::Relaxed);
                        session.touch();
                        if remote.send_payload(&payload).await.is_err() {
                            break DisconnectCause::Error;
                        }
                    }
                }
            }
        };
        let downstream = async {
            let mut timeouts = 0u32;
            loop {
                if session.kicked.load(Ordering::Acquire) {
                    break DisconnectCause::Kicked;
                }
                match tokio::time::timeout(RELAY_READ_DEADLINE, remote.next_payload()).await {
                    Err(_) => {
                        timeouts += 1;
                        if timeouts >= RELAY_MAX_TIMEOUTS {
                            break DisconnectCause::TimeoutServer;
                        }
                    }
                    Ok(None) => break DisconnectCause::Server,
                    Ok(Some(payload)) => {
                        timeouts = 0;
                        session
                            .bytes_down
                            .fetch_add(payload.len() as u64, Ordering::Relaxed);
                        session.touch();
                        if !session.encrypted.load(Ordering::Acquire) {
                            self.spy_downstream(session, &payload, &disconnect_reason);
                        }
                        if client.send_payload(&payload).await.is_err() {
                            break DisconnectCause::Error;
                        }
                    }
                }
            }
        };
        let pump_remote = async {
            let mut buf = [0u8; 2048];
            loop {
                match remote.transport().recv(&mut buf).await {
                    Ok(len) => {
                        let data = Bytes::copy_from_slice(&buf[..len]);
                        if remote.handle_datagram(data).await.is_err() {
                            break DisconnectCause::Error;
                        }
                        if remote.is_closed() {
                            break DisconnectCause::Server;
                        }
                    }
                    Err(_) => break DisconnectCause::TimeoutServer,
                }
            }
        };
        let cause = tokio::select! {
            cause = upstream => cause,
            cause = downstream => cause,
            cause = pump_remote => cause,
            _ = self.stop_notify.notified() => DisconnectCause::Unknown,
        };
        let reason = {
            let reason = match disconnect_reason.lock() {
                Ok(reason) => reason,
                Err(poisoned) => poisoned.into_inner(),
            };
            reason.clone()
        };
        match reason {
            Some(reason) if !reason.is_empty() => log::info!(
                "[{}] Session {} closed ({}): {}",
                server_id,
                session.addr,
                cause.to_str(),
                reason
            ),
            _ => log::info!(
                "[{}] Session {} closed ({})",
                server_id,
                session.addr,
                cause.to_str()
            ),
        }
    }

    /// Pre-encryption look at a remote payload: flags the encryption
    /// start and captures an unencrypted Disconnect reason.
    fn spy_downstream(
        &self,
        session: &Arc<Session>,
        payload: &[u8],
        disconnect_reason: &Mutex<Option<String>>,
    ) {
        if session.login_parsed.load(Ordering::Acquire)
            && payload.first() == Some(&raknet::GAME_PACKET_HEADER)
            && payload
                .get(1)
                .is_some_and(|id| Compression::from_id(*id).is_none())
        {
            session.encrypted.store(true, Ordering::Release);
            return;
        }
        if let Some(message) = disconnect::parse_game_disconnect(payload) {
            let mut reason = match disconnect_reason.lock() {
                Ok(reason) => reason,
                Err(poisoned) => poisoned.into_inner(),
            };
            *reason = Some(message);
        }
    }

    async fn run_cleanup(&self) {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        let mut ticks: u64 = 0;
        loop {
            tokio::select! {
                _ = self.stop_notify.notified() => return,
                _ = interval.tick() => {}
            }
            ticks += 1;
            self.responder.gc_rate_limits();
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
                for session in self.sessions.all().await {
                    if session.idle_for() > idle_timeout {
                        if let Some((_, conn)) = self.conns.remove(&session.addr) {
                            conn.disconnect().await;
                        }
                    }
                }
                self.sessions.gc(idle_timeout).await;
            }
        }
    }
}

async fn resolve_target(target: &str) -> SocketAddr {
    match tokio::net::lookup_host(target).await {
        Ok(mut addrs) => addrs
            .next()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0))),
        Err(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
    }
}

#[async_trait::async_trait]
impl ProxyEngine for PassthroughProxy {
    async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        log::debug!(
            "Starting passthrough proxy server on {}",
            self.socket.local_addr()?
        );
        self.push_task(tokio::spawn({
            let engine = self.clone();
            async move {
                engine.run_cleanup().await;
            }
        }));

        let mut buf = [0u8; 2048];
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
                            "[{}] Unable to handle player datagram: {:?}",
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
        for entry in self.conns.iter() {
            entry.value().mark_closed();
        }
        self.conns.clear();
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
            session.kicked.store(true, Ordering::Release);
            let conn = self.conns.remove(&session.addr).map(|(_, conn)| conn);
            self.sessions.remove(&session.addr).await;
            if let Some(conn) = conn {
                // the client may already be encrypted; it will then show a
                // generic message instead of ours
                if session.encrypted.load(Ordering::Acquire) {
                    log::warn!(
                        "[{}] Kicking {}: {}",
                        session.server_id,
                        session.addr,
                        crate::ProxyError::EncryptedKickUnsupported
                    );
                }
                let compression = Compression::from_id(
                    session.login_compression.load(Ordering::Acquire),
                )
                .unwrap_or(Compression::Flate);
                let packet = disconnect::build_game_disconnect(&message, compression);
                self.push_task(tokio::spawn(async move {
                    let _ = conn.send_payload(&packet).await;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    conn.disconnect().await;
                }));
            }
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
