//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all wire-level failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A line exceeded the maximum allowed size before a newline arrived.
    #[error("line too long: {size} bytes exceeds maximum of {max} bytes")]
    LineTooLong {
        /// Bytes buffered when the limit was hit.
        size: usize,
        /// Maximum allowed line size.
        max: usize,
    },

    /// The request named a command the daemon does not implement.
    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),

    /// The payload of a known command was malformed.
    #[error("invalid payload for {command}: {reason}")]
    InvalidPayload {
        /// The command whose payload was rejected.
        command: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
}

impl ProtocolError {
    /// Shorthand for [`ProtocolError::InvalidPayload`].
    pub fn invalid_payload(command: impl Into<String>, reason: impl Into<String>) -> Self {
        ProtocolError::InvalidPayload {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::ConnectionClosed(err.to_string())
    }
}
