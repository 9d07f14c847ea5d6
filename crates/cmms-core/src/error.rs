//! Error types for the duplex RPC transport.
//!
//! Every fatal class (write, decode, protocol violation) converges on a single
//! "connection failed" event in the client; pending callers then observe
//! [`TransportError::ConnectionFailed`].

use thiserror::Error;

/// Main error type for the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    // Connection setup
    #[error("Failed to connect to {addr}: {message}")]
    Dial { addr: String, message: String },

    #[error("Handshake failed: {message}")]
    Handshake { message: String },

    // Write path
    #[error("Encode error: {message}")]
    Encode { message: String },

    #[error("Write error: {message}")]
    Write { message: String },

    // Read path
    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Protocol violation: reply seq {seq} ({method}) matches no pending call")]
    ProtocolViolation { seq: u64, method: String },

    // Outcomes observed by callers
    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Connection closed")]
    Closed,

    #[error("Connection not ready (state: {state})")]
    NotReady { state: String },

    #[error("Remote error from {method}: {message}")]
    Remote { method: String, message: String },

    #[error("Sequence numbers exhausted")]
    SequenceExhausted,

    // Server side
    #[error("Unknown channel: {channel}")]
    UnknownChannel { channel: u64 },

    /// Failure raised by a call handler; travels to the caller verbatim.
    #[error("{message}")]
    Call { message: String },

    // Wrapped lower-level errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl TransportError {
    /// Whether this error leaves the connection unusable.
    ///
    /// Fatal errors tear the connection down and fail every pending call.
    /// `Remote` errors only fail the call that produced them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Encode { .. }
                | TransportError::Write { .. }
                | TransportError::Decode { .. }
                | TransportError::FrameTooLarge { .. }
                | TransportError::ProtocolViolation { .. }
                | TransportError::Io { .. }
        )
    }

    /// Handler-level failure reported back to the caller as-is.
    pub fn call(message: impl Into<String>) -> Self {
        TransportError::Call {
            message: message.into(),
        }
    }

    /// The error a pending caller receives when the connection fails because of `self`.
    pub fn to_connection_failed(&self) -> TransportError {
        TransportError::ConnectionFailed {
            reason: self.to_string(),
        }
    }
}
