//! Error types and handling for the peerlink session layer.
//!
//! Every component reports through [`PeerlinkError`]. Area-specific enums keep
//! the variants grouped, and the helpers on [`PeerlinkError`] classify which
//! failures are recoverable and which terminate the message in progress.

use thiserror::Error;

/// Result type alias for the peerlink library
pub type Result<T> = std::result::Result<T, PeerlinkError>;

/// Top-level error for all peerlink operations
#[derive(Error, Debug, Clone)]
pub enum PeerlinkError {
    /// Wire format and codec errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Session orchestration errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Body spooling errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Transport-reported failures
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Identity key errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Configuration and setup errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Base64 encoding/decoding errors
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// UTF-8 conversion errors
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// Generic error for unexpected conditions
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Wire format and codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Version byte does not match this protocol revision
    #[error("Unsupported protocol version: {version}")]
    UnsupportedVersion { version: u8 },

    /// Header bytes are not a valid structured header
    #[error("Malformed header: {reason}")]
    MalformedHeader { reason: String },

    /// Encoded header does not fit the 24-bit length field
    #[error("Header too large: {size} bytes (max: {max})")]
    HeaderTooLarge { size: usize, max: usize },

    /// A chunk of zero bytes was requested
    #[error("Chunk length must be non-zero")]
    InvalidChunkLength,

    /// Missing required header field
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    /// Header names a message type this revision does not know
    #[error("Unknown message type: {message_type}")]
    UnknownMessageType { message_type: String },
}

/// Session orchestration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Non-identity message arrived before the identity handshake completed
    #[error("Message from unidentified sender: {identifier}")]
    UnidentifiedSender { identifier: String },

    /// No transport currently reaches the identifier
    #[error("No reachable transport for {identifier}")]
    NoReachableTransport { identifier: String },

    /// Peer is not known to this manager
    #[error("Unknown peer: {peer}")]
    UnknownPeer { peer: String },

    /// Manager has been stopped
    #[error("Session manager stopped")]
    Stopped,

    /// Identifier disconnected before the message was delivered
    #[error("Disconnected: {identifier}")]
    Disconnected { identifier: String },
}

/// Body spooling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Writing an oversized body to its backing file failed
    #[error("Body storage failed: {reason}")]
    BodyStorage { reason: String },

    /// Reading body bytes back failed
    #[error("Body read failed: {reason}")]
    BodyRead { reason: String },
}

/// Transport-reported failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Transport refused to accept data for transmission
    #[error("Send rejected for {identifier}")]
    SendRejected { identifier: String },

    /// Transport accepted data but reported a delivery failure
    #[error("Delivery to {identifier} failed: {reason}")]
    Delivery { identifier: String, reason: String },
}

/// Identity key errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Invalid key format or size
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Missing required configuration
    #[error("Missing configuration: {field}")]
    MissingField { field: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation { path: String },
}

impl PeerlinkError {
    /// Creates a new unexpected error with a custom message
    pub fn unexpected<S: Into<String>>(msg: S) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Returns true if the condition never needs to reach the caller as fatal
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Session(SessionError::NoReachableTransport { .. })
                | Self::Session(SessionError::UnidentifiedSender { .. })
                | Self::Session(SessionError::Disconnected { .. })
                | Self::Transport(_)
                | Self::Protocol(ProtocolError::MalformedHeader { .. })
        )
    }

    /// Returns true if this error ends the message currently being received
    pub fn terminates_message(&self) -> bool {
        matches!(
            self,
            Self::Protocol(ProtocolError::UnsupportedVersion { .. })
                | Self::Protocol(ProtocolError::MalformedHeader { .. })
                | Self::Storage(StorageError::BodyStorage { .. })
        )
    }
}

impl From<std::io::Error> for PeerlinkError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PeerlinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = PeerlinkError::Protocol(ProtocolError::UnsupportedVersion { version: 7 });
        assert!(error.to_string().contains("Unsupported protocol version: 7"));
    }

    #[test]
    fn test_error_recovery() {
        let queued = PeerlinkError::Session(SessionError::NoReachableTransport {
            identifier: "aa:bb".to_string(),
        });
        assert!(queued.is_recoverable());
        assert!(!queued.terminates_message());

        let storage = PeerlinkError::Storage(StorageError::BodyStorage {
            reason: "disk full".to_string(),
        });
        assert!(!storage.is_recoverable());
        assert!(storage.terminates_message());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: PeerlinkError = io.into();
        assert!(matches!(err, PeerlinkError::Io(ref s) if s.contains("boom")));
    }
}
