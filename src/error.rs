//! Error types for the session layer.

use thiserror::Error;
use crate::identity::ConnectionIdentity;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Bad magic, inconsistent length, unknown command id or malformed payload. The physical socket
    ///  that produced the frame is considered poisoned.
    #[error("framing error: {0}")]
    Framing(String),

    /// Read / write failure or remote close of a physical socket.
    #[error("transport I/O error: {0}")]
    TransportIo(#[from] std::io::Error),

    /// A frame that is well-formed but makes no sense in the receiver's state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The connection could not be rejoined within the configured attempts or timeout - this is a terminal,
    ///  non-graceful disconnect.
    #[error("rejoin of {identity} failed: {reason}")]
    RejoinTimeout {
        identity: ConnectionIdentity,
        reason: DisconnectReason,
    },

    /// The connection was closed (gracefully) and can not be used for writing any more.
    #[error("connection is closed")]
    Closed,

    #[error("handshake timed out")]
    HandshakeTimeout,
}

impl From<bytes::TryGetError> for SessionError {
    fn from(value: bytes::TryGetError) -> Self {
        SessionError::Framing(format!("incomplete frame payload: {}", value))
    }
}

/// Why a connection was abandoned without a graceful close
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DisconnectReason {
    /// the active side gave up after this number of failed attempts
    AttemptsExhausted(u32),
    /// the passive side waited for a rejoin in vain
    PassiveTimeout,
    /// the peer no longer knows the connection
    UnknownToPeer,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::AttemptsExhausted(n) => write!(f, "gave up after {} attempts", n),
            DisconnectReason::PassiveTimeout => write!(f, "peer did not rejoin in time"),
            DisconnectReason::UnknownToPeer => write!(f, "peer does not know the connection any more"),
        }
    }
}

impl SessionError {
    /// transport-level failures are retried internally by rejoining
    pub fn is_transport_level(&self) -> bool {
        matches!(self, SessionError::Framing(_) | SessionError::TransportIo(_) | SessionError::HandshakeTimeout)
    }
}
