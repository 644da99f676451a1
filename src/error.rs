use crate::config::ConfigError;
use thiserror::Error;

/// Categorizes errors for caller decision-making.
///
/// This is a lightweight, cloneable representation of the error type
/// that can be passed around without dragging the source error along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket-level I/O or WebSocket failure
    Transport,
    /// Unparseable frame or unexpected opcode sequence
    ProtocolViolation,
    /// The gateway invalidated the session
    SessionInvalidated,
    /// HELLO, READY or RESUMED did not arrive in time
    HandshakeTimeout,
    /// Heartbeat ack missing
    ZombieConnection,
    /// Authentication or permanent close code
    FatalClose,
    /// Any other close
    Closed,
    /// Shard or fleet was torn down
    ShuttingDown,
    /// Bad configuration or collaborator failure
    Config,
    /// Other error
    Other,
}

/// Handshake stage that timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    Hello,
    Ready,
    Resumed,
}

impl std::fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeStage::Hello => f.write_str("HELLO"),
            HandshakeStage::Ready => f.write_str("READY"),
            HandshakeStage::Resumed => f.write_str("RESUMED"),
        }
    }
}

/// Errors that can occur in gateway-shard-core
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Socket-level failure (connect, DNS, TLS, abrupt drop)
    #[error("Transport error: {0}")]
    Transport(String),

    /// A frame could not be decoded or arrived out of order
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The gateway sent INVALID_SESSION
    #[error("Session invalidated (resumable: {resumable})")]
    SessionInvalidated { resumable: bool },

    /// A handshake step did not complete in time
    #[error("Timed out waiting for {stage}")]
    HandshakeTimeout { stage: HandshakeStage },

    /// The gateway stopped acknowledging heartbeats
    #[error("Zombie connection: heartbeat was not acknowledged")]
    ZombieConnection,

    /// Authentication or other permanent failure. Not retried.
    #[error("Fatal close {code}: {reason}")]
    FatalClose { code: u16, reason: String },

    /// Socket closed with a retryable code
    #[error("Connection closed with code {code}: {reason}")]
    Closed { code: u16, reason: String },

    /// zlib-stream inflate failure
    #[error("Decompression failed: {0}")]
    Decompression(String),

    /// Pending identify wait was cancelled
    #[error("Identify wait cancelled for shard {shard_id}")]
    IdentifyCancelled { shard_id: u32 },

    /// The shard was destroyed before the operation finished
    #[error("Shard {shard_id} was destroyed")]
    Destroyed { shard_id: u32 },

    /// Fleet is shutting down
    #[error("Fleet is shutting down")]
    ShuttingDown,

    /// Channel send error
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// No shard with this id in the fleet
    #[error("Unknown shard {0}")]
    UnknownShard(u32),

    /// RestLookup failed
    #[error("Gateway lookup failed: {0}")]
    GatewayLookup(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) | Error::Transport(_) | Error::Decompression(_) => ErrorKind::Transport,
            Error::ProtocolViolation(_) | Error::Serialization(_) => ErrorKind::ProtocolViolation,
            Error::SessionInvalidated { .. } => ErrorKind::SessionInvalidated,
            Error::HandshakeTimeout { .. } => ErrorKind::HandshakeTimeout,
            Error::ZombieConnection => ErrorKind::ZombieConnection,
            Error::FatalClose { .. } => ErrorKind::FatalClose,
            Error::Closed { .. } => ErrorKind::Closed,
            Error::IdentifyCancelled { .. } | Error::Destroyed { .. } | Error::ShuttingDown => ErrorKind::ShuttingDown,
            Error::GatewayLookup(_) | Error::Config(_) => ErrorKind::Config,
            Error::ChannelSend(_) | Error::UnknownShard(_) => ErrorKind::Other,
        }
    }

    /// Fatal errors stop the shard; everything else is retried locally.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::FatalClose { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_fatal_close_is_fatal() {
        let fatal = Error::FatalClose { code: 4004, reason: "Authentication failed.".into() };
        assert!(fatal.is_fatal());
        assert_eq!(fatal.kind(), ErrorKind::FatalClose);

        assert!(!Error::ZombieConnection.is_fatal());
        assert!(!Error::SessionInvalidated { resumable: false }.is_fatal());
        assert!(!Error::HandshakeTimeout { stage: HandshakeStage::Hello }.is_fatal());
        assert!(!Error::Closed { code: 4000, reason: String::new() }.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = Error::HandshakeTimeout { stage: HandshakeStage::Resumed };
        assert_eq!(err.to_string(), "Timed out waiting for RESUMED");
        assert_eq!(Error::UnknownShard(7).to_string(), "Unknown shard 7");
    }
}
