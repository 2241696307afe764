//! Library to run a Raknet-aware reverse proxy for
//! Minecraft: Bedrock Edition servers.
//!
//! Each proxied server gets its own engine: either a raw UDP forwarder
//! that peeks at the unencrypted Login handshake, or a passthrough engine
//! that terminates Raknet and replays the handshake against the remote.
//! Both share the session registry, the access-control seam and the
//! outbound manager with its load balancer.

pub mod acl;
pub mod config;
pub mod disconnect;
pub mod engine;
pub mod error;
pub mod login;
pub mod outbound;
pub mod proxy_port;
pub mod session;

pub use error::ProxyError;

use std::sync::Arc;

use acl::{AccessOracle, ExternalVerifier};
use outbound::OutboundManager;
use session::{PlayerStatsSink, SessionSink};

/// Why a player disconnected from a server.
#[derive(Debug, Clone, Copy)]
pub enum DisconnectCause {
    /// Connection closed normally. Could be initiated by either
    /// the server or the client.
    Normal,
    /// Found disconnect notification from the server.
    Server,
    /// Player was refused or removed by access control.
    Kicked,
    /// Player <-> Proxy connection timed out.
    TimeoutClient,
    /// Proxy <-> Server connection timed out.
    TimeoutServer,
    /// An unexpected error occurred.
    Error,
    /// Unknown cause.
    Unknown,
}

impl DisconnectCause {
    pub fn to_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Server => "server",
            Self::Kicked => "kicked",
            Self::TimeoutClient => "client timeout",
            Self::TimeoutServer => "server timeout",
            Self::Error => "unexpected error",
            Self::Unknown => "unknown",
        }
    }
}

/// Collaborators an engine depends on. Passed explicitly; the engines
/// keep no global state.
pub struct Dependencies {
    /// Access control oracle.
    pub oracle: Arc<dyn AccessOracle>,
    /// Optional external identity verifier, consulted after the oracle.
    pub verifier: Option<Arc<dyn ExternalVerifier>>,
    /// Outbound connection manager.
    pub outbounds: Arc<OutboundManager>,
    /// Session history sink.
    pub session_sink: Arc<dyn SessionSink>,
    /// Per-player traffic stats sink.
    pub stats_sink: Arc<dyn PlayerStatsSink>,
}

impl Dependencies {
    /// Dependencies with no-op sinks, an allow-all oracle and an empty
    /// outbound manager. Useful for tests and minimal deployments.
    pub fn minimal() -> Self {
        Self {
            oracle: Arc::new(acl::AllowAllOracle),
            verifier: None,
            outbounds: Arc::new(OutboundManager::new()),
            session_sink: Arc::new(session::NoopSessionSink),
            stats_sink: Arc::new(session::NoopStatsSink),
        }
    }
}
