use crate::config::ConfigError;
use crate::protocol::CloseCode;
use std::sync::Arc;
use thiserror::Error;

/// Categorizes errors for handler decision-making.
///
/// This is a lightweight, cloneable representation of the error type
/// that mirrors how the shard reacts to the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport level failure (network reset, WebSocket protocol error)
    Transport,
    /// Malformed frame or unknown opcode; the connection continues
    Protocol,
    /// The shared inflate stream is corrupt; the transport must be replaced
    Compression,
    /// Heartbeat went unacknowledged
    Liveness,
    /// Session state was rejected by the gateway
    Session,
    /// Bad token, intents or sharding; never retried
    Fatal,
    /// A member request precondition was not met
    Capability,
    /// Shard is shutting down
    ShuttingDown,
    /// Other error
    Other,
}

/// Errors that can occur while running a gateway shard.
///
/// `Error` is cheap to clone so the same value can be surfaced to the
/// handler as an event and returned from [`ShardConnection::run`](crate::ShardConnection::run).
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(Arc<tokio_tungstenite::tungstenite::Error>),

    /// The transport could not be opened
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No HELLO arrived within the connect timeout
    #[error("Connection timeout")]
    ConnectTimeout,

    /// A frame could not be decoded
    #[error("Failed to decode gateway frame: {0}")]
    Decode(String),

    /// The streaming inflate context failed
    #[error("zlib error: {0}")]
    Decompress(String),

    /// The previous heartbeat was never acknowledged
    #[error("Server didn't acknowledge previous heartbeat, possible lost connection")]
    HeartbeatTimeout,

    /// The gateway closed the connection with a protocol close code
    #[error("Gateway closed the connection ({code}): {message}")]
    Gateway { code: CloseCode, message: String },

    /// No token was configured
    #[error("Invalid token")]
    InvalidToken,

    /// A request cannot be issued with the configured intents or arguments
    #[error("{0}")]
    Capability(String),

    /// `connect` was called while a connection is already established
    #[error("Shard {0} connect called while an existing connection is established")]
    AlreadyConnected(u32),

    /// Shard is shutting down
    #[error("Shard is shutting down")]
    ShuttingDown,

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) | Error::ConnectionFailed(_) | Error::ConnectTimeout => {
                ErrorKind::Transport
            }
            Error::Decode(_) => ErrorKind::Protocol,
            Error::Decompress(_) => ErrorKind::Compression,
            Error::HeartbeatTimeout => ErrorKind::Liveness,
            Error::Gateway { code, .. } if code.is_fatal() => ErrorKind::Fatal,
            Error::Gateway { code, .. } if code.clears_session() || code.resets_sequence() => {
                ErrorKind::Session
            }
            Error::Gateway { .. } => ErrorKind::Transport,
            Error::InvalidToken | Error::Config(_) => ErrorKind::Fatal,
            Error::Capability(_) => ErrorKind::Capability,
            Error::ShuttingDown => ErrorKind::ShuttingDown,
            Error::AlreadyConnected(_) => ErrorKind::Other,
        }
    }

    /// Whether this error terminates the shard without automatic reconnection.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl From<flate2::DecompressError> for Error {
    fn from(err: flate2::DecompressError) -> Self {
        Error::Decompress(err.to_string())
    }
}
