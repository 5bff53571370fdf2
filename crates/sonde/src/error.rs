//! Error types for the sonde host library

use thiserror::Error;

/// Main error type for sonde host operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SondeError {
    /// The referenced session, script, or provider does not exist
    #[error("not found")]
    NotFound,

    /// RPC bring-up exceeded its deadline
    #[error("timed out")]
    TimedOut,

    /// A loopback port is taken. Internal to the port probe; never
    /// surfaced to callers.
    #[error("address in use")]
    AddressInUse,

    /// The operation failed; details in the message
    #[error("{0}")]
    Failed(String),

    /// An in-flight operation was cancelled. Internal signal from the
    /// bring-up timer; callers observe [`SondeError::TimedOut`].
    #[error("cancelled")]
    Cancelled,
}

impl SondeError {
    /// Create a [`SondeError::Failed`] from anything printable
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<std::io::Error> for SondeError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::AddrInUse {
            Self::AddressInUse
        } else {
            Self::Failed(err.to_string())
        }
    }
}

impl From<sonde_proto::ProtocolError> for SondeError {
    fn from(err: sonde_proto::ProtocolError) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<sonde_transport::TransportError> for SondeError {
    fn from(err: sonde_transport::TransportError) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<sonde_proto::message::ErrorDetails> for SondeError {
    fn from(details: sonde_proto::message::ErrorDetails) -> Self {
        match details.code {
            sonde_proto::message::ErrorCode::NotFound => Self::NotFound,
            _ => Self::Failed(details.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_in_use_mapping() {
        let io = std::io::Error::from(std::io::ErrorKind::AddrInUse);
        assert_eq!(SondeError::from(io), SondeError::AddressInUse);
    }

    #[test]
    fn test_other_io_mapping() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(SondeError::from(io), SondeError::Failed(_)));
    }

    #[test]
    fn test_error_details_mapping() {
        use sonde_proto::message::{ErrorCode, ErrorDetails};

        let not_found = ErrorDetails::new(ErrorCode::NotFound, "gone");
        assert_eq!(SondeError::from(not_found), SondeError::NotFound);

        let failed = ErrorDetails::new(ErrorCode::Failed, "invalid script id");
        assert_eq!(
            SondeError::from(failed),
            SondeError::Failed("invalid script id".to_string())
        );
    }
}
