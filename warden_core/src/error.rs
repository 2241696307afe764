//! Engine error taxonomy.
//!
//! Only failures that cross a component boundary get a variant here;
//! local recoveries (dropped datagrams, declined Login parses) stay
//! `Option`-shaped at their call sites.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Bad Raknet framing or an oversized datagram. Recovered locally by
    /// dropping the datagram.
    #[error("malformed datagram: {0}")]
    MalformedDatagram(String),

    /// Batch decompression failed or exceeded the output cap.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// Every candidate node failed to dial.
    #[error("outbound dial to {target} via {node} failed: {source}")]
    OutboundDial {
        target: String,
        node: String,
        #[source]
        source: anyhow::Error,
    },

    /// The selector produced no healthy candidate.
    #[error("no healthy outbound node for selector {selector:?}")]
    NoHealthyNode { selector: String },

    /// No data during the NetworkSettings/Login exchange.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// A kick arrived after encryption started; the game-level message
    /// will likely be ignored by the client.
    #[error("session already encrypted, game-level kick may be ignored")]
    EncryptedKickUnsupported,

    /// The ACL oracle failed. Handled fail-open.
    #[error("access control oracle failure: {0}")]
    AclInfrastructure(#[source] anyhow::Error),

    /// The external verifier refused or failed.
    #[error("external verification failed: {0}")]
    ExternalVerifier(String),

    /// Packet from an IP inside its ban window.
    #[error("banned ip")]
    BannedIp,
}
