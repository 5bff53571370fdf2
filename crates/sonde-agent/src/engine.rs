//! Script engine and script instances
//!
//! The engine owns every script living inside this target, funnels their
//! asynchronous messages out on one signal, and manages the process-wide
//! debugger hook. Destroying a script is a two-phase barrier: unload,
//! then drain the code tracer's garbage collector until a pass reports
//! idle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::sleep;
use tracing::debug;

use crate::runtime::{MemoryRange, Script, ScriptRuntime, Tracer};
use crate::signal::{Signal, Subscription};
use crate::AgentError;

/// Delay between garbage-collection passes while draining a destroyed
/// script's trampolines
const GC_DRAIN_INTERVAL: Duration = Duration::from_millis(50);

/// A message a script pushed toward the host
#[derive(Debug, Clone)]
pub struct EngineMessage {
    /// Originating script
    pub script: u32,
    /// Message body
    pub message: String,
    /// Optional binary payload
    pub data: Option<Bytes>,
}

/// Registry of the scripts living inside this target
pub struct ScriptEngine {
    runtime: Arc<dyn ScriptRuntime>,
    agent_range: MemoryRange,
    scripts: Mutex<HashMap<u32, Arc<ScriptInstance>>>,
    next_script_id: AtomicU32,
    message_from_script: Arc<Signal<EngineMessage>>,
    message_from_debugger: Arc<Signal<String>>,
}

impl ScriptEngine {
    /// Create an engine over `runtime`; `agent_range` is the agent's own
    /// image, which every script is told to leave uninstrumented
    pub fn new(runtime: Arc<dyn ScriptRuntime>, agent_range: MemoryRange) -> Self {
        Self {
            runtime,
            agent_range,
            scripts: Mutex::new(HashMap::new()),
            next_script_id: AtomicU32::new(0),
            message_from_script: Arc::new(Signal::new()),
            message_from_debugger: Arc::new(Signal::new()),
        }
    }

    /// Compile and register a new script
    ///
    /// The name defaults to `script<sid>` when absent.
    pub async fn create_script(
        &self,
        name: Option<&str>,
        source: &str,
    ) -> Result<u32, AgentError> {
        let sid = self.next_script_id.fetch_add(1, Ordering::SeqCst) + 1;
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("script{}", sid),
        };

        debug!("creating script {} ({})", sid, name);
        let script = self.runtime.compile(&name, source).await?;

        // The agent must never instrument itself
        script.exclude_memory_range(self.agent_range);

        let outbound = self.message_from_script.clone();
        script.set_message_handler(Some(Box::new(move |message, data| {
            outbound.emit(EngineMessage {
                script: sid,
                message,
                data,
            });
        })));

        let instance = Arc::new(ScriptInstance { sid, name, script });
        self.scripts.lock().unwrap().insert(sid, instance);
        Ok(sid)
    }

    /// Unregister and destroy a script, waiting for its instrumentation
    /// to quiesce
    pub async fn destroy_script(&self, sid: u32) -> Result<(), AgentError> {
        let instance = self
            .scripts
            .lock()
            .unwrap()
            .remove(&sid)
            .ok_or(AgentError::InvalidScriptId)?;
        instance.destroy(self.runtime.tracer()).await
    }

    /// Load a script
    pub async fn load_script(&self, sid: u32) -> Result<(), AgentError> {
        self.instance(sid)?.script.load().await
    }

    /// Deliver a message to a script
    pub async fn post_message_to_script(&self, sid: u32, message: &str) -> Result<(), AgentError> {
        self.instance(sid)?.script.post(message).await
    }

    /// Install the process-wide debug-message hook
    pub fn enable_debugger(&self) {
        let outbound = self.message_from_debugger.clone();
        self.runtime.set_debug_handler(Some(Box::new(move |message| {
            outbound.emit(message);
        })));
    }

    /// Remove the process-wide debug-message hook; safe without a prior
    /// enable
    pub fn disable_debugger(&self) {
        self.runtime.set_debug_handler(None);
    }

    /// Deliver a message to the debugger, hooked or not
    pub async fn post_message_to_debugger(&self, message: &str) {
        self.runtime.post_debug_message(message).await;
    }

    /// Messages pushed by scripts
    pub fn message_from_script(&self) -> Subscription<EngineMessage> {
        self.message_from_script.subscribe()
    }

    /// Messages pushed by the debugger
    pub fn message_from_debugger(&self) -> Subscription<String> {
        self.message_from_debugger.subscribe()
    }

    /// Number of live scripts
    pub fn script_count(&self) -> usize {
        self.scripts.lock().unwrap().len()
    }

    /// Name of a live script
    pub fn script_name(&self, sid: u32) -> Result<String, AgentError> {
        Ok(self.instance(sid)?.name.clone())
    }

    /// Destroy every script and clear the registry
    pub async fn shutdown(&self) {
        let instances: Vec<Arc<ScriptInstance>> = {
            let mut scripts = self.scripts.lock().unwrap();
            scripts.drain().map(|(_, instance)| instance).collect()
        };

        for instance in instances {
            if let Err(e) = instance.destroy(self.runtime.tracer()).await {
                debug!("script {} destroy failed during shutdown: {}", instance.sid, e);
            }
        }
    }

    fn instance(&self, sid: u32) -> Result<Arc<ScriptInstance>, AgentError> {
        self.scripts
            .lock()
            .unwrap()
            .get(&sid)
            .cloned()
            .ok_or(AgentError::InvalidScriptId)
    }
}

/// One registered script and its capability
pub struct ScriptInstance {
    sid: u32,
    name: String,
    script: Box<dyn Script>,
}

impl ScriptInstance {
    /// Script id
    pub fn sid(&self) -> u32 {
        self.sid
    }

    /// Script name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unload the script, then block until the code tracer's garbage
    /// collector reports no residual trampolines
    pub(crate) async fn destroy(&self, tracer: &dyn Tracer) -> Result<(), AgentError> {
        self.script.set_message_handler(None);
        self.script.unload().await?;

        while tracer.garbage_collect() {
            sleep(GC_DRAIN_INTERVAL).await;
        }

        debug!("script {} destroyed", self.sid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackRuntime;

    fn engine() -> ScriptEngine {
        ScriptEngine::new(Arc::new(LoopbackRuntime::new()), MemoryRange::default())
    }

    #[tokio::test]
    async fn test_default_script_names() {
        let engine = engine();

        let first = engine.create_script(None, "probe()").await.unwrap();
        let second = engine.create_script(None, "probe()").await.unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(engine.script_name(first).unwrap(), "script1");
        assert_eq!(engine.script_name(second).unwrap(), "script2");
    }

    #[tokio::test]
    async fn test_explicit_script_name() {
        let engine = engine();
        let sid = engine.create_script(Some("hooks"), "probe()").await.unwrap();
        assert_eq!(engine.script_name(sid).unwrap(), "hooks");
    }

    #[tokio::test]
    async fn test_destroy_succeeds_exactly_once() {
        let engine = engine();
        let sid = engine.create_script(None, "probe()").await.unwrap();

        assert!(engine.destroy_script(sid).await.is_ok());

        let second = engine.destroy_script(sid).await;
        assert_eq!(second, Err(AgentError::InvalidScriptId));
        assert_eq!(second.unwrap_err().to_string(), "invalid script id");
    }

    #[tokio::test]
    async fn test_unknown_sid_operations() {
        let engine = engine();
        assert_eq!(
            engine.load_script(99).await,
            Err(AgentError::InvalidScriptId)
        );
        assert_eq!(
            engine.post_message_to_script(99, "hi").await,
            Err(AgentError::InvalidScriptId)
        );
    }

    #[tokio::test]
    async fn test_script_messages_are_tagged_with_sid() {
        let engine = engine();
        let mut messages = engine.message_from_script();

        let sid = engine.create_script(None, "probe()").await.unwrap();
        engine.load_script(sid).await.unwrap();
        engine.post_message_to_script(sid, "ping").await.unwrap();

        let event = messages.recv().await.unwrap();
        assert_eq!(event.script, sid);
        assert_eq!(event.message, "ping");
    }

    #[tokio::test]
    async fn test_destroy_drains_tracer() {
        let runtime = Arc::new(LoopbackRuntime::with_gc_passes(3));
        let engine = ScriptEngine::new(runtime.clone(), MemoryRange::default());

        let sid = engine.create_script(None, "probe()").await.unwrap();
        engine.load_script(sid).await.unwrap();
        engine.destroy_script(sid).await.unwrap();

        // Destruction only returns once a pass reported idle
        assert!(!runtime.tracer_handle().garbage_collect());
    }

    #[tokio::test]
    async fn test_debugger_enable_disable() {
        let engine = engine();
        let mut debug_messages = engine.message_from_debugger();

        engine.enable_debugger();
        engine.post_message_to_debugger("break").await;
        assert_eq!(debug_messages.recv().await.unwrap(), "break");

        engine.disable_debugger();
        engine.post_message_to_debugger("lost").await;
        assert!(debug_messages.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_disable_debugger_without_enable() {
        let engine = engine();
        engine.disable_debugger();
    }

    #[tokio::test]
    async fn test_shutdown_destroys_everything() {
        let engine = engine();
        engine.create_script(None, "a()").await.unwrap();
        engine.create_script(None, "b()").await.unwrap();
        assert_eq!(engine.script_count(), 2);

        engine.shutdown().await;
        assert_eq!(engine.script_count(), 0);
    }

    #[tokio::test]
    async fn test_scripts_exclude_agent_range() {
        let runtime = Arc::new(LoopbackRuntime::new());
        let range = MemoryRange::new(0x7000_0000, 0x2000);
        let engine = ScriptEngine::new(runtime.clone(), range);

        engine.create_script(None, "probe()").await.unwrap();
        assert_eq!(runtime.excluded_ranges(), vec![range]);
    }
}
