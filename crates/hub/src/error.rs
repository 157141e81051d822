//! Relay hub error types

use relaydesk_shared::SchemaError;

/// Why a connection was dropped by the hub
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    // Protocol errors
    #[error("Expected handshake, received {0}")]
    HandshakeRequired(&'static str),
    #[error("Connection already completed its handshake")]
    DuplicateHandshake,
    #[error("Handshake not received in time")]
    HandshakeTimeout,
    #[error("Invalid frame: {0}")]
    InvalidFrame(#[from] SchemaError),
    #[error("Binary frames are not supported")]
    BinaryFrame,

    // Delivery errors
    #[error("Outbound queue full")]
    SlowConsumer,

    // Lifecycle
    #[error("Unknown connection")]
    UnknownConnection,
    #[error("Connection closed by peer")]
    PeerClosed,
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Relay shutting down")]
    Shutdown,
}

impl HubError {
    /// WebSocket close code sent to the peer before dropping it (RFC 6455 §7.4.1)
    pub fn close_code(&self) -> u16 {
        match self {
            HubError::HandshakeRequired(_)
            | HubError::DuplicateHandshake
            | HubError::HandshakeTimeout => 1008,
            HubError::InvalidFrame(SchemaError::TooLarge { .. }) => 1009,
            HubError::InvalidFrame(_) => 1007,
            HubError::BinaryFrame => 1003,
            HubError::SlowConsumer => 1013,
            HubError::Shutdown => 1001,
            HubError::PeerClosed => 1000,
            HubError::UnknownConnection | HubError::Transport(_) => 1011,
        }
    }

    /// Whether the error was caused by the peer violating the protocol
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            HubError::HandshakeRequired(_)
                | HubError::DuplicateHandshake
                | HubError::HandshakeTimeout
                | HubError::InvalidFrame(_)
                | HubError::BinaryFrame
        )
    }
}

/// Result type alias for hub operations
pub type HubResult<T> = Result<T, HubError>;
