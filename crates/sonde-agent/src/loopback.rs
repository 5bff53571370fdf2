//! Loopback runtime
//!
//! A stand-in scripting engine for builds without a real one linked in:
//! compilation accepts any source, loaded scripts echo every posted
//! message back through their message handler, and the debugger echoes
//! likewise. The tracer simulates trampoline cleanup by reporting a
//! configurable number of busy passes after each unload.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::runtime::{DebugHandler, MemoryRange, MessageHandler, Script, ScriptRuntime, Tracer};
use crate::AgentError;

/// Tracer whose garbage collector reports busy for a preset number of
/// passes after each unload
pub struct LoopbackTracer {
    pending: AtomicUsize,
}

impl LoopbackTracer {
    fn new() -> Self {
        Self {
            pending: AtomicUsize::new(0),
        }
    }

    fn add_pending(&self, passes: usize) {
        self.pending.fetch_add(passes, Ordering::SeqCst);
    }
}

impl Tracer for LoopbackTracer {
    fn garbage_collect(&self) -> bool {
        self.pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Loopback scripting engine
pub struct LoopbackRuntime {
    tracer: Arc<LoopbackTracer>,
    gc_passes_per_unload: usize,
    debug_handler: Mutex<Option<DebugHandler>>,
    excluded: Arc<Mutex<Vec<MemoryRange>>>,
}

impl LoopbackRuntime {
    /// Create a runtime whose unloads leave one busy GC pass behind
    pub fn new() -> Self {
        Self::with_gc_passes(1)
    }

    /// Create a runtime whose unloads leave `passes` busy GC passes
    pub fn with_gc_passes(passes: usize) -> Self {
        Self {
            tracer: Arc::new(LoopbackTracer::new()),
            gc_passes_per_unload: passes,
            debug_handler: Mutex::new(None),
            excluded: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Direct handle to the tracer
    pub fn tracer_handle(&self) -> &LoopbackTracer {
        &self.tracer
    }

    /// Every memory range scripts have been told to leave alone
    pub fn excluded_ranges(&self) -> Vec<MemoryRange> {
        self.excluded.lock().unwrap().clone()
    }
}

impl Default for LoopbackRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScriptRuntime for LoopbackRuntime {
    async fn compile(&self, name: &str, source: &str) -> Result<Box<dyn Script>, AgentError> {
        if source.is_empty() {
            return Err(AgentError::runtime(format!("{}: empty source", name)));
        }

        Ok(Box::new(LoopbackScript {
            loaded: AtomicBool::new(false),
            handler: Mutex::new(None),
            tracer: self.tracer.clone(),
            gc_passes_per_unload: self.gc_passes_per_unload,
            excluded: self.excluded.clone(),
        }))
    }

    fn set_debug_handler(&self, handler: Option<DebugHandler>) {
        *self.debug_handler.lock().unwrap() = handler;
    }

    async fn post_debug_message(&self, message: &str) {
        if let Some(handler) = &*self.debug_handler.lock().unwrap() {
            handler(message.to_string());
        }
    }

    fn tracer(&self) -> &dyn Tracer {
        &*self.tracer
    }
}

struct LoopbackScript {
    loaded: AtomicBool,
    handler: Mutex<Option<MessageHandler>>,
    tracer: Arc<LoopbackTracer>,
    gc_passes_per_unload: usize,
    excluded: Arc<Mutex<Vec<MemoryRange>>>,
}

#[async_trait]
impl Script for LoopbackScript {
    async fn load(&self) -> Result<(), AgentError> {
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unload(&self) -> Result<(), AgentError> {
        if self.loaded.swap(false, Ordering::SeqCst) {
            self.tracer.add_pending(self.gc_passes_per_unload);
        }
        Ok(())
    }

    async fn post(&self, message: &str) -> Result<(), AgentError> {
        if !self.loaded.load(Ordering::SeqCst) {
            return Err(AgentError::runtime("script is not loaded"));
        }

        if let Some(handler) = &*self.handler.lock().unwrap() {
            handler(message.to_string(), None);
        }
        Ok(())
    }

    fn set_message_handler(&self, handler: Option<MessageHandler>) {
        *self.handler.lock().unwrap() = handler;
    }

    fn exclude_memory_range(&self, range: MemoryRange) {
        self.excluded.lock().unwrap().push(range);
    }
}
