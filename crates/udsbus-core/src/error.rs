//! Error types for udsbus.
//!
//! Every failure the engine can observe maps onto one `IpcError` variant.
//! Session-level failures never escape `Ipc::run`; they are logged and the
//! role arbiter starts a new cycle.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the bus.
#[derive(Debug, Error)]
pub enum IpcError {
    // Transport errors
    #[error("Connection read failed: {message}")]
    ConnectionReadFailed {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Connection write failed: {message}")]
    ConnectionWriteFailed {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    #[error("Packet encode failed: {message}")]
    PacketEncodeFailed { message: String },

    #[error("Ping timeout: peer silent for {silent:?} (limit {limit:?})")]
    PingTimeout { silent: Duration, limit: Duration },

    // Arbitration errors
    #[error("Dial exhausted after {attempts} attempts to {path}: {last_error}")]
    DialExhausted {
        path: PathBuf,
        attempts: u32,
        last_error: String,
    },

    #[error("Socket unavailable at {path}: {reason}")]
    SocketUnavailable { path: PathBuf, reason: String },

    // Frame errors
    #[error("Message too large: {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: u64, limit: u64 },

    #[error("Malformed frame: {message}")]
    MalformedFrame { message: String },

    // Message payload errors
    #[error("Payload error: {message}")]
    Payload { message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, IpcError>;

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        IpcError::Payload {
            message: err.to_string(),
        }
    }
}

impl IpcError {
    /// Wrap an I/O error raised while reading from a connection.
    pub fn read(err: std::io::Error) -> Self {
        IpcError::ConnectionReadFailed {
            message: err.to_string(),
            source: Some(err),
        }
    }

    /// Wrap an I/O error raised while writing to a connection.
    pub fn write(err: std::io::Error) -> Self {
        IpcError::ConnectionWriteFailed {
            message: err.to_string(),
            source: Some(err),
        }
    }

    /// Copy of this error with any I/O source dropped.
    ///
    /// Used where one failure must be reported to two parties, such as a
    /// waiting sender and the session that is ending because of it.
    pub fn detached(&self) -> IpcError {
        match self {
            IpcError::ConnectionReadFailed { message, .. } => IpcError::ConnectionReadFailed {
                message: message.clone(),
                source: None,
            },
            IpcError::ConnectionWriteFailed { message, .. } => IpcError::ConnectionWriteFailed {
                message: message.clone(),
                source: None,
            },
            IpcError::HandshakeFailed { reason } => IpcError::HandshakeFailed {
                reason: reason.clone(),
            },
            IpcError::PacketEncodeFailed { message } => IpcError::PacketEncodeFailed {
                message: message.clone(),
            },
            IpcError::PingTimeout { silent, limit } => IpcError::PingTimeout {
                silent: *silent,
                limit: *limit,
            },
            IpcError::DialExhausted {
                path,
                attempts,
                last_error,
            } => IpcError::DialExhausted {
                path: path.clone(),
                attempts: *attempts,
                last_error: last_error.clone(),
            },
            IpcError::SocketUnavailable { path, reason } => IpcError::SocketUnavailable {
                path: path.clone(),
                reason: reason.clone(),
            },
            IpcError::MessageTooLarge { size, limit } => IpcError::MessageTooLarge {
                size: *size,
                limit: *limit,
            },
            IpcError::MalformedFrame { message } => IpcError::MalformedFrame {
                message: message.clone(),
            },
            IpcError::Payload { message } => IpcError::Payload {
                message: message.clone(),
            },
            IpcError::Config { message } => IpcError::Config {
                message: message.clone(),
            },
            IpcError::Io { message, .. } => IpcError::Io {
                message: message.clone(),
                source: None,
            },
            IpcError::Other(message) => IpcError::Other(message.clone()),
        }
    }

    /// Stable short name of the error kind, used in log lines.
    pub fn kind_name(&self) -> &'static str {
        match self {
            IpcError::ConnectionReadFailed { .. } => "ConnectionReadFailed",
            IpcError::ConnectionWriteFailed { .. } => "ConnectionWriteFailed",
            IpcError::HandshakeFailed { .. } => "HandshakeFailed",
            IpcError::PacketEncodeFailed { .. } => "PacketEncodeFailed",
            IpcError::PingTimeout { .. } => "PingTimeout",
            IpcError::DialExhausted { .. } => "DialExhausted",
            IpcError::SocketUnavailable { .. } => "SocketUnavailable",
            IpcError::MessageTooLarge { .. } => "MessageTooLarge",
            IpcError::MalformedFrame { .. } => "MalformedFrame",
            IpcError::Payload { .. } => "Payload",
            IpcError::Config { .. } => "Config",
            IpcError::Io { .. } => "Io",
            IpcError::Other(_) => "Other",
        }
    }

    /// Check if a dial attempt that failed with this error is worth repeating.
    ///
    /// A missing or refused socket may simply mean the broker is between
    /// unlink and bind, so those are retried. Configuration problems are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            IpcError::Io {
                source: Some(io), ..
            } => !matches!(
                io.kind(),
                std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::InvalidInput
            ),
            IpcError::Io { source: None, .. } => true,
            IpcError::ConnectionReadFailed { .. }
            | IpcError::ConnectionWriteFailed { .. }
            | IpcError::SocketUnavailable { .. } => true,
            _ => false,
        }
    }
}
