//! # Sonde Agent
//!
//! The in-target side of sonde: a script engine servicing the host's RPC
//! over whatever byte stream the loader handed it, pushing script and
//! debugger messages back the same way.

#![warn(missing_docs)]

/// Agent error types
pub mod error;

/// Script runtime abstraction
pub mod runtime;

/// Loopback runtime for hosts without a real scripting engine linked in
pub mod loopback;

/// Script engine and script instances
pub mod engine;

/// RPC service loop
pub mod agent;

mod signal;

pub use agent::AgentLoop;
pub use engine::{EngineMessage, ScriptEngine, ScriptInstance};
pub use error::AgentError;
pub use loopback::{LoopbackRuntime, LoopbackTracer};
pub use runtime::{DebugHandler, MemoryRange, MessageHandler, Script, ScriptRuntime, Tracer};
pub use signal::{Signal, Subscription};
