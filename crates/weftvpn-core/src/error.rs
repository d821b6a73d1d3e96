//! Coordinator errors

use std::time::Duration;

use thiserror::Error;
use weftvpn_trust::TrustError;

/// Coordinator errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration error, fatal at open
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Endpoint resolution failed
    #[error("Resolution of {endpoint} failed: {message}")]
    Resolution { endpoint: String, message: String },

    /// Invalid endpoint specification
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Invalid network/prefix specification
    #[error("Invalid network: {0}")]
    InvalidNetwork(String),

    /// Malformed control message
    #[error("Malformed control message: {0}")]
    MalformedMessage(String),

    /// The core is not open
    #[error("Core is not open")]
    NotOpen,

    /// The core is already open
    #[error("Core is already open")]
    AlreadyOpen,

    /// Secure channel error
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Trust layer error
    #[error("Trust error: {0}")]
    Trust(#[from] TrustError),
}

/// Result type for coordinator operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors reported by the secure channel engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// No hello response arrived within the timeout
    #[error("Hello request timed out after {timeout:?}")]
    HelloTimeout { timeout: Duration },

    /// A send operation failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The engine is closed
    #[error("Engine is closed")]
    Closed,

    /// Transport-level error
    #[error("IO error: {0}")]
    Io(String),
}
