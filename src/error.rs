//! Error types for the relay

use thiserror::Error;

/// Relay error type
#[derive(Error, Debug)]
pub enum RelayError {
    /// RADIUS payload shorter than the fixed 20-byte header
    #[error("radius: packet not at least 20 bytes long")]
    TruncatedPacket,

    /// RADIUS length field disagrees with the datagram length
    #[error("radius: length field says {field} bytes, payload is {actual}")]
    LengthMismatch { field: usize, actual: usize },

    /// Raw socket could not be opened or configured
    #[error("raw socket init: {0}")]
    SocketInit(#[source] std::io::Error),

    /// Background thread could not be spawned
    #[error("failed to spawn {0}")]
    Spawn(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),
}

/// Result type for the relay
pub type RelayResult<T> = Result<T, RelayError>;
