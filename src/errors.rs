//! Error types for rc_link operations
//!
//! Errors only surface at construction, `connect()`, configuration and the
//! adapter/driver seam. The steady-state send/receive API reports through
//! booleans, `Option`s, connection state and metrics instead.
use std::io;

use thiserror::Error;

/// Result type alias for rc_link operations
pub type Result<T> = std::result::Result<T, RcError>;

/// rc_link error enumeration
///
/// Covers the failure modes of the link:
/// - Fatal initialisation (runtime, driver hardware)
/// - Transient driver failures
/// - Malformed frames at the parse boundary
/// - Discovery/bootstrap failures
/// - Configuration problems
#[derive(Debug, Clone, Error)]
pub enum RcError {
    /// No async runtime available to host the link's background tasks
    #[error("runtime unavailable: {0}")]
    Runtime(String),

    /// Radio or network hardware failed to initialise
    #[error("driver initialisation failed: {0}")]
    DriverInit(String),

    /// A single driver operation failed (send, peer table update, association)
    #[error("driver error: {0}")]
    Driver(String),

    /// Raw frame length differs from the fixed message size
    #[error("invalid packet length: expected {expected}, received {received}")]
    InvalidPacketLength { expected: usize, received: usize },

    /// Raw frame carries a type byte this transport does not accept
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Null or otherwise unusable node address
    #[error("invalid node address: {0}")]
    InvalidAddress(String),

    /// Unicast to an address missing from the driver's peer table
    #[error("peer not registered: {0}")]
    PeerNotFound(String),

    /// Discovery or bootstrap exhausted its attempts
    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),

    /// Protocol-specific configuration key not supported by this transport
    #[error("unsupported configuration key: {0}")]
    UnsupportedConfig(String),

    /// Configuration value out of range or inconsistent
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed
    #[error("configuration parse error: {0}")]
    ConfigParse(String),

    /// Socket or file I/O failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for RcError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<toml::de::Error> for RcError {
    fn from(err: toml::de::Error) -> Self {
        Self::ConfigParse(err.to_string())
    }
}
