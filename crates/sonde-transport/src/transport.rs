//! Transport ownership abstraction

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

/// Bidirectional byte stream to an in-target agent
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> IoStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Boxed agent stream as produced by an attach hook
pub type BoxedStream = Box<dyn IoStream>;

/// Owner of whatever keeps an agent stream usable
///
/// An attach may ride on a tethering context, a loader scratch directory,
/// or nothing at all; the session layer holds the owner for at least as
/// long as the stream and releases everything by dropping it. The owner is
/// not assumed to be a stream itself.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Short label for log lines
    fn describe(&self) -> &str;
}

/// Transport owner for attaches that hold no extra resources
#[derive(Debug, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn describe(&self) -> &str {
        "null"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_transport() {
        let transport: Box<dyn Transport> = Box::new(NullTransport);
        assert_eq!(transport.describe(), "null");
    }
}
