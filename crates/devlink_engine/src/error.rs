//! Engine error types.

use std::time::Duration;

use crate::connection::ConnectionId;

/// Errors surfaced by the [`Engine`](crate::Engine) facade and by
/// [`ConnectionHandle`](crate::connection::ConnectionHandle).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The listener could not bind its address (e.g. port already in use).
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A transport-level failure (connect refused, reset, write failure).
    #[error("Transport error: {0}")]
    Transport(String),

    /// No authenticated session exists for the requested device.
    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    /// The connection was already closed when the operation was attempted.
    #[error("Connection closed: {0}")]
    ConnectionClosed(ConnectionId),

    /// An operation did not complete within its deadline.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The engine has been shut down.
    #[error("Engine shut down")]
    ShutDown,

    /// JSON serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A frame that could not be turned into an [`Envelope`](crate::Envelope).
///
/// Decode errors are local to one connection: the peer gets an `error`
/// frame carrying [`wire_code`](DecodeError::wire_code) and the connection
/// keeps reading, except for [`FrameTooLong`](DecodeError::FrameTooLong).
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed frame {snippet:?}: {source}")]
    Malformed {
        snippet: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Frame is not a message envelope: {snippet:?}")]
    NotAnEnvelope { snippet: String },

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLong { len: usize, max: usize },
}

impl DecodeError {
    /// The `errorCode` reported to the peer.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::Malformed { .. } | Self::NotAnEnvelope { .. } => "invalid_message",
            Self::FrameTooLong { .. } => "frame_too_long",
        }
    }

    /// Whether the connection can keep reading after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::FrameTooLong { .. })
    }
}
