//! # Sonde
//!
//! Host control plane for the sonde dynamic instrumentation framework.
//!
//! A [`Service`] aggregates backends that discover target systems as
//! providers; a provider hands out a [`session::HostSession`] for process
//! work and attaching, and every attach yields an agent session that can
//! create, load, message, and destroy instrumentation scripts inside the
//! target.

#![warn(missing_docs)]

pub use sonde_proto as proto;
pub use sonde_transport as transport;

/// Error types for the sonde host library
pub mod error;

/// Typed event channels with multi-subscriber fan-out
pub mod signal;

/// RPC connection and typed session proxy
pub mod rpc;

/// Providers: discoverable target systems
pub mod provider;

/// Backend abstraction
pub mod backend;

/// Built-in backends
pub mod backends;

/// Service: backend aggregation and lifecycle
pub mod service;

/// Attach session management
pub mod session;

mod reexport;

pub use backend::Backend;
pub use error::SondeError;
pub use provider::{Icon, Provider, ProviderKind};
pub use rpc::{AgentScriptId, AgentSessionProxy, ClosedInfo, RpcConnection, ScriptMessage};
pub use service::Service;
pub use session::{
    AgentSessionId, AttachHook, AttachManager, HostSession, ProcessInfo, SessionEntry,
    DEFAULT_AGENT_PORT,
};
pub use signal::{Signal, Subscription};

/// Result type alias for sonde host operations
pub type Result<T> = std::result::Result<T, SondeError>;
