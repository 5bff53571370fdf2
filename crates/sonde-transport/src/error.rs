//! Transport-specific error types

use std::io;
use thiserror::Error;

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection-level failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Loader handshake failure
    #[error("loader handshake error: {0}")]
    Handshake(String),

    /// Injection failure reported by the injector collaborator
    #[error("injection error: {0}")]
    Injection(String),

    /// A handshake value exceeded the single-byte length prefix
    #[error("handshake value too long: {len} bytes (max: 255)")]
    ValueTooLong {
        /// Actual value length
        len: usize,
    },

    /// Agent image digest mismatch
    #[error("agent image digest mismatch: expected {expected}, got {actual}")]
    Integrity {
        /// Pinned digest
        expected: String,
        /// Computed digest
        actual: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
