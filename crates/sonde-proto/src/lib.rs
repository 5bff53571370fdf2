//! # Sonde Protocol
//!
//! Protocol definitions, message types, and codec for the RPC channel
//! between a sonde host and an agent injected into a target process.

#![warn(missing_docs)]

/// Frame structure and serialization
pub mod frame;

/// Message types and enums
pub mod message;

/// Frame codec for async streams
pub mod codec;

/// Error types for protocol operations
pub mod error;

pub use codec::FrameCodec;
pub use error::ProtocolError;
pub use frame::{Frame, FrameFlags};
pub use message::{Event, Message, Request, Response};

/// Well-known object paths exported over an agent connection.
pub mod object_path {
    /// Path at which every agent registers its session interface.
    pub const AGENT_SESSION: &str = "/re/sonde/AgentSession";
}
