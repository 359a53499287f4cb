//! Error types for the route exposure daemon
//!
//! Predicate non-matches are not errors and never surface here. Everything
//! else that can abort an operation does.

use thiserror::Error;

/// Result type alias for route exposure operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    /// A malformed IP or CIDR literal was rejected before any kernel call
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// A device could not be resolved to a kernel index
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Failure reported by the kernel-facing collaborator
    #[error("Kernel operation failed: {0}")]
    Kernel(String),

    /// Southbound database query failure
    #[error("Southbound database error: {0}")]
    Southbound(String),

    /// Northbound transaction failure
    #[error("Northbound transaction failed: {0}")]
    Northbound(String),

    /// Peer sent something the wire protocol does not allow
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Full synchronization failed
    #[error("Synchronization failed: {0}")]
    Sync(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors (sockets, procfs)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an invalid address error
    pub fn invalid_address(msg: impl Into<String>) -> Self {
        Self::InvalidAddress(msg.into())
    }

    /// Create a device lookup error
    pub fn device_not_found(device: impl Into<String>) -> Self {
        Self::DeviceNotFound(device.into())
    }

    /// Create a kernel error
    pub fn kernel(msg: impl Into<String>) -> Self {
        Self::Kernel(msg.into())
    }

    /// Create a southbound error
    pub fn southbound(msg: impl Into<String>) -> Self {
        Self::Southbound(msg.into())
    }

    /// Create a northbound error
    pub fn northbound(msg: impl Into<String>) -> Self {
        Self::Northbound(msg.into())
    }

    /// Create a protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a synchronization error
    pub fn sync(msg: impl Into<String>) -> Self {
        Self::Sync(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error must close the peer connection
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Self::Decode(err.to_string())
    }
}
