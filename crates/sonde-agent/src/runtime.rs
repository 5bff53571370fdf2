//! Script runtime abstraction
//!
//! The concrete scripting engine is an opaque collaborator; the agent
//! only needs these capability traits. A runtime compiles sources into
//! [`Script`]s, owns the process-wide debugger hook, and exposes the code
//! tracer whose garbage collector must drain before a script's resources
//! may be released.

use async_trait::async_trait;
use bytes::Bytes;

use crate::AgentError;

/// A range of target memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryRange {
    /// Base address
    pub base: u64,
    /// Size in bytes
    pub size: u64,
}

impl MemoryRange {
    /// Create a range
    pub fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }
}

/// Callback for messages a script emits
pub type MessageHandler = Box<dyn Fn(String, Option<Bytes>) + Send + Sync>;

/// Callback for messages the debugger emits
pub type DebugHandler = Box<dyn Fn(String) + Send + Sync>;

/// The scripting engine collaborator
#[async_trait]
pub trait ScriptRuntime: Send + Sync {
    /// Compile `source` into a script named `name`
    async fn compile(&self, name: &str, source: &str) -> Result<Box<dyn Script>, AgentError>;

    /// Install or clear the process-wide debug-message hook
    fn set_debug_handler(&self, handler: Option<DebugHandler>);

    /// Deliver a message to the script debugger
    async fn post_debug_message(&self, message: &str);

    /// The code tracer backing this runtime
    fn tracer(&self) -> &dyn Tracer;
}

/// One compiled unit of instrumentation code
#[async_trait]
pub trait Script: Send + Sync {
    /// Start executing the script
    async fn load(&self) -> Result<(), AgentError>;

    /// Stop the script and tear down its instrumentation
    async fn unload(&self) -> Result<(), AgentError>;

    /// Deliver a message to the script
    async fn post(&self, message: &str) -> Result<(), AgentError>;

    /// Install or clear the script's outbound message callback
    fn set_message_handler(&self, handler: Option<MessageHandler>);

    /// Keep the given memory range out of the instrumented universe
    fn exclude_memory_range(&self, range: MemoryRange);
}

/// Code-tracing engine hooks needed by script teardown
pub trait Tracer: Send + Sync {
    /// Run one garbage-collection pass; true while trampolines are still
    /// pending in target threads
    fn garbage_collect(&self) -> bool;
}
