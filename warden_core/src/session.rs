//! Sessions and their registry.
//!
//! A session is created on the first datagram of a client endpoint and
//! destroyed on disconnect, kick or idle timeout. Counters and flags are
//! atomics so the forwarding hot path never takes a lock; the registry
//! lock guards only the endpoint map and is never held across I/O.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use raknet::conn::PacketConn;
use raknet::datatypes::U24_MAX;
use raknet::split::SplitBuffers;
use tokio::sync::{Notify, RwLock};
use uuid::Uuid;

use crate::login::PlayerIdentity;

/// Interval of the registry garbage collection tick.
pub const GC_INTERVAL: Duration = Duration::from_secs(30);

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as i64)
        .unwrap_or(0)
}

/// One proxied client connection.
pub struct Session {
    /// Unique ID (not persistent across restart).
    pub id: Uuid,
    /// ID of the proxy server owning this session.
    pub server_id: String,
    /// Remote player client address.
    pub addr: SocketAddr,
    /// When the session was created.
    pub started_at: SystemTime,

    identity: OnceLock<PlayerIdentity>,

    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
    pub packets: AtomicU64,
    last_seen: AtomicU64,

    /// Whether the Login packet has been recognized.
    pub login_parsed: AtomicBool,
    /// Whether the session was refused or removed by access control.
    pub kicked: AtomicBool,
    /// Whether post-handshake traffic looks encrypted.
    pub encrypted: AtomicBool,
    /// Compression id observed on the client's Login packet.
    pub login_compression: AtomicU8,

    // observed server-side send state, kept to inject well-ordered frames
    send_datagram_seq: AtomicU32,
    send_message_index: AtomicU32,
    send_order_index: AtomicU32,

    /// Split reassembly for pre-login inspection.
    pub splits: Mutex<SplitBuffers>,

    outbound: tokio::sync::Mutex<Option<Arc<dyn PacketConn>>>,
    /// Cancels the per-session remote-read loop.
    pub close_notify: Notify,
    ended: AtomicBool,
}

impl Session {
    fn new(addr: SocketAddr, server_id: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            server_id,
            addr,
            started_at: SystemTime::now(),
            identity: OnceLock::new(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            packets: AtomicU64::new(0),
            last_seen: AtomicU64::new(unix_nanos() as u64),
            login_parsed: AtomicBool::new(false),
            kicked: AtomicBool::new(false),
            encrypted: AtomicBool::new(false),
            login_compression: AtomicU8::new(0x00),
            send_datagram_seq: AtomicU32::new(0),
            send_message_index: AtomicU32::new(0),
            send_order_index: AtomicU32::new(0),
            splits: Mutex::new(SplitBuffers::new()),
            outbound: tokio::sync::Mutex::new(None),
            close_notify: Notify::new(),
            ended: AtomicBool::new(false),
        }
    }

    /// Player identity, set once after Login.
    pub fn identity(&self) -> Option<&PlayerIdentity> {
        self.identity.get()
    }

    /// Stores the identity. Later calls are ignored; identity fields are
    /// read-only once the login is parsed.
    pub fn set_identity(&self, identity: PlayerIdentity) {
        let _ = self.identity.set(identity);
        self.login_parsed.store(true, Ordering::Release);
    }

    /// Monotonically advances the last-seen timestamp.
    pub fn touch(&self) {
        let now = unix_nanos() as u64;
        self.last_seen.fetch_max(now, Ordering::AcqRel);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_seen.load(Ordering::Acquire);
        let now = unix_nanos() as u64;
        Duration::from_nanos(now.saturating_sub(last))
    }

    /// Advances a 24-bit send counter to at least `observed`. Best-effort
    /// around the 24-bit wrap, which is fine for typical single-channel
    /// traffic.
    fn advance_index(counter: &AtomicU32, observed: u32) {
        let observed = observed & U24_MAX;
        let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (observed > current & U24_MAX).then_some(observed)
        });
    }

    /// Records send state observed on the server->client direction.
    pub fn observe_send_state(&self, datagram_seq: u32, message_index: u32, order_index: u32) {
        Self::advance_index(&self.send_datagram_seq, datagram_seq);
        Self::advance_index(&self.send_message_index, message_index);
        Self::advance_index(&self.send_order_index, order_index);
    }

    /// Next (seq, message, order) indices for an injected frame, each one
    /// past anything observed, masked to 24 bits.
    pub fn next_injected_indices(&self) -> (u32, u32, u32) {
        let bump = |counter: &AtomicU32| {
            (counter.fetch_add(1, Ordering::AcqRel).wrapping_add(1)) & U24_MAX
        };
        (
            bump(&self.send_datagram_seq),
            bump(&self.send_message_index),
            bump(&self.send_order_index),
        )
    }

    pub async fn set_outbound(&self, conn: Arc<dyn PacketConn>) {
        let mut outbound = self.outbound.lock().await;
        *outbound = Some(conn);
    }

    pub async fn outbound(&self) -> Option<Arc<dyn PacketConn>> {
        self.outbound.lock().await.clone()
    }

    async fn close_outbound(&self) {
        let mut outbound = self.outbound.lock().await;
        *outbound = None;
        self.close_notify.notify_waiters();
    }

    /// Immutable record of a finished session, handed to sinks.
    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            id: self.id,
            server_id: self.server_id.clone(),
            addr: self.addr,
            identity: self.identity.get().cloned(),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            packets: self.packets.load(Ordering::Relaxed),
            started_at: self.started_at,
            duration: self.started_at.elapsed().unwrap_or_default(),
        }
    }
}

/// Snapshot of a session at teardown.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: Uuid,
    pub server_id: String,
    pub addr: SocketAddr,
    pub identity: Option<PlayerIdentity>,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub packets: u64,
    pub started_at: SystemTime,
    pub duration: Duration,
}

/// Session history sink, invoked exactly once per ended session.
#[async_trait::async_trait]
pub trait SessionSink: Send + Sync {
    async fn on_session_end(&self, record: &SessionRecord);
}

/// Per-player traffic stats sink.
#[async_trait::async_trait]
pub trait PlayerStatsSink: Send + Sync {
    async fn update_stats(&self, player_name: &str, bytes_added: u64, duration_added: Duration);
}

pub struct NoopSessionSink;

#[async_trait::async_trait]
impl SessionSink for NoopSessionSink {
    async fn on_session_end(&self, _record: &SessionRecord) {}
}

pub struct NoopStatsSink;

#[async_trait::async_trait]
impl PlayerStatsSink for NoopStatsSink {
    async fn update_stats(&self, _player_name: &str, _bytes: u64, _duration: Duration) {}
}

/// Optional per-session idle timeout override.
pub type IdleOverrideFn = dyn Fn(&Session) -> Option<Duration> + Send + Sync;

/// Registry mapping client endpoints to sessions for one server.
pub struct SessionRegistry {
    server_id: String,
    sessions: RwLock<HashMap<SocketAddr, Arc<Session>>>,
    session_sink: Arc<dyn SessionSink>,
    stats_sink: Arc<dyn PlayerStatsSink>,
    idle_override: Option<Arc<IdleOverrideFn>>,
}

impl SessionRegistry {
    pub fn new(
        server_id: String,
        session_sink: Arc<dyn SessionSink>,
        stats_sink: Arc<dyn PlayerStatsSink>,
    ) -> Self {
        Self {
            server_id,
            sessions: RwLock::new(HashMap::new()),
            session_sink,
            stats_sink,
            idle_override: None,
        }
    }

    pub fn with_idle_override(mut self, idle_override: Arc<IdleOverrideFn>) -> Self {
        self.idle_override = Some(idle_override);
        self
    }

    /// Looks up or atomically creates the session for an endpoint.
    /// The created flag is true for exactly one caller.
    pub async fn get_or_create(&self, addr: SocketAddr) -> (Arc<Session>, bool) {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(&addr) {
                return (session.clone(), false);
            }
        }
        let mut sessions = self.sessions.write().await;
        match sessions.get(&addr) {
            Some(session) => (session.clone(), false),
            None => {
                let session = Arc::new(Session::new(addr, self.server_id.clone()));
                sessions.insert(addr, session.clone());
                (session, true)
            }
        }
    }

    pub async fn get(&self, addr: &SocketAddr) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions.get(addr).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Removes and tears down the session of an endpoint.
    pub async fn remove(&self, addr: &SocketAddr) -> Option<Arc<Session>> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(addr)?
        };
        self.finish(&session).await;
        Some(session)
    }

    /// Removes every session whose player name matches, case-insensitively.
    pub async fn remove_by_player_name(&self, name: &str) -> Vec<Arc<Session>> {
        self.remove_matching(|session| {
            session
                .identity()
                .is_some_and(|identity| identity.display_name.eq_ignore_ascii_case(name))
        })
        .await
    }

    /// Removes every session with a matching XUID.
    pub async fn remove_by_xuid(&self, xuid: &str) -> Vec<Arc<Session>> {
        self.remove_matching(|session| {
            session
                .identity()
                .is_some_and(|identity| !identity.xuid.is_empty() && identity.xuid == xuid)
        })
        .await
    }

    async fn remove_matching<F>(&self, matches: F) -> Vec<Arc<Session>>
    where
        F: Fn(&Session) -> bool,
    {
        let removed: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            let addrs: Vec<SocketAddr> = sessions
                .iter()
                .filter(|(_, session)| matches(session))
                .map(|(addr, _)| *addr)
                .collect();
            addrs
                .into_iter()
                .filter_map(|addr| sessions.remove(&addr))
                .collect()
        };
        for session in &removed {
            self.finish(session).await;
        }
        removed
    }

    /// Removes sessions idle past the timeout. Called from the cleanup
    /// task on a [`GC_INTERVAL`] tick.
    pub async fn gc(&self, idle_timeout: Duration) -> usize {
        let idle_override = self.idle_override.clone();
        let expired: Vec<SocketAddr> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, session)| {
                    let timeout = idle_override
                        .as_ref()
                        .and_then(|f| f(session))
                        .unwrap_or(idle_timeout);
                    session.idle_for() > timeout
                })
                .map(|(addr, _)| *addr)
                .collect()
        };
        let mut count = 0;
        for addr in expired {
            if let Some(session) = self.remove(&addr).await {
                log::debug!(
                    "[{}] Session {} reclaimed after {:?} idle",
                    self.server_id,
                    session.addr,
                    session.idle_for()
                );
                count += 1;
            }
        }
        count
    }

    /// Tears down every session. Used on engine stop.
    pub async fn clear(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, session)| session).collect()
        };
        for session in &drained {
            self.finish(session).await;
        }
    }

    async fn finish(&self, session: &Session) {
        session.close_outbound().await;
        if session.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        let record = session.record();
        self.session_sink.on_session_end(&record).await;
        if let Some(identity) = &record.identity {
            self.stats_sink
                .update_stats(
                    &identity.display_name,
                    record.bytes_up + record.bytes_down,
                    record.duration,
                )
                .await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    pub(crate) fn session_for_tests() -> Session {
        Session::new(SocketAddr::from(([127, 0, 0, 1], 40000)), "s1".to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_registry() -> SessionRegistry {
        SessionRegistry::new(
            "s1".to_owned(),
            Arc::new(NoopSessionSink),
            Arc::new(NoopStatsSink),
        )
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    struct CountingSink(AtomicUsize);

    #[async_trait::async_trait]
    impl SessionSink for CountingSink {
        async fn on_session_end(&self, _record: &SessionRecord) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let registry = Arc::new(test_registry());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(
                async move { registry.get_or_create(addr(1)).await },
            ));
        }
        let mut created_count = 0;
        let mut ids = Vec::new();
        for handle in handles {
            let (session, created) = handle.await.unwrap();
            ids.push(session.id);
            if created {
                created_count += 1;
            }
        }
        assert_eq!(created_count, 1);
        assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[tokio::test]
    async fn remove_fires_sink_exactly_once() {
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let registry = SessionRegistry::new(
            "s1".to_owned(),
            sink.clone(),
            Arc::new(NoopStatsSink),
        );
        let (_, created) = registry.get_or_create(addr(2)).await;
        assert!(created);
        assert!(registry.remove(&addr(2)).await.is_some());
        assert!(registry.remove(&addr(2)).await.is_none());
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remove_by_player_name_is_case_insensitive() {
        let registry = test_registry();
        let (session, _) = registry.get_or_create(addr(3)).await;
        session.set_identity(PlayerIdentity {
            display_name: "Alice".to_owned(),
            uuid: "u-1".to_owned(),
            xuid: "x-1".to_owned(),
        });
        let (_, _) = registry.get_or_create(addr(4)).await;
        let removed = registry.remove_by_player_name("aLiCe").await;
        assert_eq!(removed.len(), 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn gc_reclaims_idle_sessions() {
        let registry = test_registry();
        let (session, _) = registry.get_or_create(addr(5)).await;
        assert_eq!(registry.gc(Duration::from_secs(60)).await, 0);
        // simulate inactivity by rewinding last_seen
        session.last_seen.store(0, Ordering::Release);
        assert_eq!(registry.gc(Duration::from_secs(60)).await, 1);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn identity_is_write_once() {
        let registry = test_registry();
        let (session, _) = registry.get_or_create(addr(6)).await;
        session.set_identity(PlayerIdentity {
            display_name: "First".to_owned(),
            uuid: String::new(),
            xuid: String::new(),
        });
        session.set_identity(PlayerIdentity {
            display_name: "Second".to_owned(),
            uuid: String::new(),
            xuid: String::new(),
        });
        assert_eq!(session.identity().unwrap().display_name, "First");
    }

    #[test]
    fn injected_indices_advance_past_observed() {
        let session = Session::new(addr(7), "s1".to_owned());
        session.observe_send_state(100, 50, 25);
        // lower observations never move an index backwards
        session.observe_send_state(90, 10, 2);
        let (seq, msg, order) = session.next_injected_indices();
        assert_eq!((seq, msg, order), (101, 51, 26));
    }

    #[test]
    fn send_state_wraps_to_24_bits() {
        let session = Session::new(addr(8), "s1".to_owned());
        session.observe_send_state(U24_MAX, U24_MAX, U24_MAX);
        let (seq, _, _) = session.next_injected_indices();
        assert_eq!(seq, 0);
    }
}
