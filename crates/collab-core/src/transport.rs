//! Transport abstraction — a message-oriented duplex stream.
//!
//! The core is transport-agnostic: WebSocket framing, HTTP upgrade, and TLS
//! all live outside this crate. `collab-server` supplies the axum-backed
//! implementation; tests use an in-memory channel pair.

use async_trait::async_trait;

/// Close code sent alongside a transport close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    ProtocolError,
    AuthRejected,
    ServerError,
    Unauthorized,
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::ProtocolError => 1002,
            CloseCode::AuthRejected => 1008,
            CloseCode::ServerError => 1011,
            CloseCode::Unauthorized => 4100,
        }
    }
}

/// A duplex, message-oriented transport for one connected client.
///
/// Implementations are not required to be order-preserving across distinct
/// connections, but must preserve order within a single connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a single binary message. The transport frames it as one unit;
    /// the core never chunks messages.
    async fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Close the connection with a code and human-readable reason.
    async fn close(&self, code: CloseCode, reason: &str);
}

/// A transport-level failure. Distinct from a clean close, which is
/// terminal-but-not-an-error.
#[derive(Debug, thiserror::Error)]
#[error("transport send failed: {0}")]
pub struct TransportError(pub String);

/// Type-erased send half of a connection, used wherever code needs to fan a
/// message out to a set of peers without being generic over their concrete
/// `Transport` (documents are shared across connections of differing
/// transport types in principle, though in practice one process runs one).
#[async_trait]
pub trait OutboundSink: Send + Sync + 'static {
    async fn send(&self, bytes: Vec<u8>);
}
