use crate::config::ConfigError;
use thiserror::Error;

/// Categorizes errors for caller decision-making.
///
/// This is a lightweight, cloneable representation of the error type
/// that can be matched on without holding the full error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// WebSocket protocol error
    WebSocket,
    /// Connection failed (timeout, refused, too many attempts, etc.)
    ConnectionFailed,
    /// Gateway closed the connection or violated the protocol
    Protocol,
    /// Payload could not be encoded, decoded or decompressed
    Codec,
    /// A request was rejected before anything was sent
    InvalidRequest,
    /// Manager or shard is shutting down
    ShuttingDown,
    /// Invalid configuration
    Config,
    /// Other error
    Other,
}

/// Errors that can occur in gateway-shards
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Dialing failed, or reconnecting gave up; `attempts` counts dials so far
    #[error("Connection failed on attempt {attempts}: {last_error}")]
    ConnectionFailed {
        attempts: u32,
        last_error: String,
    },

    /// Gateway-level connection error, usually derived from a close code
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Inbound frame could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Outbound frame could not be encoded
    #[error("Encode error: {0}")]
    Encode(String),

    /// Streaming decompressor failed
    #[error("Decompression error: {0}")]
    Decompress(String),

    /// Request rejected by validation, never sent
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Shard has no live connection
    #[error("Shard {0} is not connected")]
    NotConnected(u32),

    /// Shard id is not managed by this manager
    #[error("Unknown shard {0}")]
    UnknownShard(u32),

    /// Outbound queue is at capacity
    #[error("Outbound queue full ({0} frames)")]
    QueueFull(usize),

    /// Gateway resolution failed
    #[error("Gateway resolution failed: {0}")]
    Gateway(String),

    /// Manager is already running
    #[error("Manager is already running")]
    AlreadyRunning,

    /// Manager is shutting down
    #[error("Manager is shutting down")]
    ShuttingDown,

    /// Configuration rejected
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Channel send error
    #[error("Channel send error: {0}")]
    ChannelSend(String),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) => ErrorKind::WebSocket,
            Error::ConnectionFailed { .. } | Error::NotConnected(_) => ErrorKind::ConnectionFailed,
            Error::Connection(_) => ErrorKind::Protocol,
            Error::Decode(_) | Error::Encode(_) | Error::Decompress(_) => ErrorKind::Codec,
            Error::InvalidRequest(_) | Error::QueueFull(_) => ErrorKind::InvalidRequest,
            Error::ShuttingDown => ErrorKind::ShuttingDown,
            Error::Config(_) => ErrorKind::Config,
            Error::UnknownShard(_) | Error::Gateway(_) | Error::AlreadyRunning | Error::ChannelSend(_) => {
                ErrorKind::Other
            }
        }
    }
}

/// A connection-level failure, optionally tied to a gateway close code.
///
/// Cloneable so it can be carried by events and retained by the shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    /// Close code that produced this error, if any
    pub code: Option<u16>,
    /// Human-readable message
    pub message: String,
    fatal: bool,
}

impl ConnectionError {
    /// Error carrying a close code
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
            fatal: false,
        }
    }

    /// Error not associated with any close code (timeouts, missed heartbeats)
    pub fn local(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            fatal: false,
        }
    }

    pub(crate) fn with_fatal(mut self, fatal: bool) -> Self {
        self.fatal = fatal;
        self
    }

    /// Whether this error suppresses reconnection
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (close code {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ConnectionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::new(4004, "Authentication failed");
        assert_eq!(err.to_string(), "Authentication failed (close code 4004)");

        let err = ConnectionError::local("Connection timeout");
        assert_eq!(err.to_string(), "Connection timeout");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_error_kind() {
        let err: Error = ConnectionError::new(4008, "ratelimited").into();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(Error::InvalidRequest("x".into()).kind(), ErrorKind::InvalidRequest);
        assert_eq!(Error::NotConnected(3).kind(), ErrorKind::ConnectionFailed);
        assert_eq!(Error::Decompress("bad".into()).kind(), ErrorKind::Codec);
    }
}
