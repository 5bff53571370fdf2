//! Error types for protocol operations

use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid frame format
    #[error("invalid frame format")]
    InvalidFrame,

    /// Frame too large
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Stream-level I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// The connection was closed before the operation finished
    #[error("connection closed")]
    ConnectionClosed,
}
