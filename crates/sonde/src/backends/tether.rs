//! USB-tethered device backend
//!
//! Devices arrive and depart as the platform's device monitor reports
//! them; each live device is one provider. The device object itself knows
//! how to open a channel to an agent endpoint on the far side, so the
//! attach hook is a thin delegation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sonde_transport::{BoxedStream, Transport};
use tracing::debug;

use crate::backend::Backend;
use crate::provider::{Icon, Provider, ProviderKind};
use crate::rpc::AgentSessionProxy;
use crate::session::{AgentSessionId, AttachHook, AttachManager, HostSession, ProcessInfo};
use crate::signal::Signal;
use crate::{Result, SondeError};

/// A tethered device as reported by the platform monitor
#[async_trait]
pub trait TetherDevice: Send + Sync {
    /// Unique device identifier
    fn udid(&self) -> &str;

    /// Display name
    fn name(&self) -> &str;

    /// Optional display icon
    fn icon(&self) -> Option<Icon> {
        None
    }

    /// Open a channel to the agent endpoint for `pid`, returning the byte
    /// stream plus the tethering context that keeps it alive
    async fn open_channel(&self, pid: u32) -> Result<(BoxedStream, Box<dyn Transport>)>;
}

/// Backend publishing one provider per tethered device
pub struct TetherBackend {
    provider_available: Signal<Arc<dyn Provider>>,
    provider_unavailable: Signal<Arc<dyn Provider>>,
    devices: Mutex<HashMap<String, Arc<TetherProvider>>>,
    running: AtomicBool,
}

impl TetherBackend {
    /// Create the backend with no devices
    pub fn new() -> Self {
        Self {
            provider_available: Signal::new(),
            provider_unavailable: Signal::new(),
            devices: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Report a device arrival; announced immediately when running
    pub fn device_attached(&self, device: Arc<dyn TetherDevice>) {
        debug!("tethered device attached: {}", device.udid());

        let provider = Arc::new(TetherProvider::new(device));
        self.devices
            .lock()
            .unwrap()
            .insert(provider.udid().to_string(), provider.clone());

        if self.running.load(Ordering::SeqCst) {
            self.provider_available.emit(provider);
        }
    }

    /// Report a device departure; retracted immediately when running
    pub fn device_detached(&self, udid: &str) {
        debug!("tethered device detached: {}", udid);

        let provider = self.devices.lock().unwrap().remove(udid);
        if let Some(provider) = provider {
            if self.running.load(Ordering::SeqCst) {
                self.provider_unavailable.emit(provider);
            }
        }
    }
}

impl Default for TetherBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for TetherBackend {
    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        let providers: Vec<Arc<TetherProvider>> =
            self.devices.lock().unwrap().values().cloned().collect();
        for provider in providers {
            self.provider_available.emit(provider);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);

        let providers: Vec<Arc<TetherProvider>> =
            self.devices.lock().unwrap().values().cloned().collect();
        for provider in providers {
            provider.close().await;
            self.provider_unavailable.emit(provider);
        }
        Ok(())
    }

    fn provider_available(&self) -> &Signal<Arc<dyn Provider>> {
        &self.provider_available
    }

    fn provider_unavailable(&self) -> &Signal<Arc<dyn Provider>> {
        &self.provider_unavailable
    }
}

/// Provider for one tethered device
pub struct TetherProvider {
    device: Arc<dyn TetherDevice>,
    icon: Option<Icon>,
    session: tokio::sync::Mutex<Option<Arc<TetherSession>>>,
    agent_session_closed: Arc<Signal<(AgentSessionId, Option<String>)>>,
}

impl TetherProvider {
    fn new(device: Arc<dyn TetherDevice>) -> Self {
        let icon = device.icon();
        Self {
            device,
            icon,
            session: tokio::sync::Mutex::new(None),
            agent_session_closed: Arc::new(Signal::new()),
        }
    }

    /// Unique device identifier
    pub fn udid(&self) -> &str {
        self.device.udid()
    }

    async fn close(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.close().await;
        }
    }
}

#[async_trait]
impl Provider for TetherProvider {
    fn name(&self) -> &str {
        self.device.name()
    }

    fn icon(&self) -> Option<&Icon> {
        self.icon.as_ref()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::LocalTether
    }

    async fn create(&self) -> Result<Arc<dyn HostSession>> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            return Ok(session.clone());
        }

        let session = TetherSession::new(self.device.clone());

        let closed = self.agent_session_closed.clone();
        let mut events = session.manager().agent_session_closed().subscribe();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                closed.emit(event);
            }
        });

        *slot = Some(session.clone());
        Ok(session)
    }

    async fn obtain_agent_session(&self, id: AgentSessionId) -> Result<AgentSessionProxy> {
        let slot = self.session.lock().await;
        match slot.as_ref() {
            Some(session) => session.manager().obtain_agent_session(id),
            None => Err(SondeError::NotFound),
        }
    }

    fn agent_session_closed(&self) -> &Signal<(AgentSessionId, Option<String>)> {
        &self.agent_session_closed
    }
}

/// Host session for a tethered device
pub struct TetherSession {
    manager: AttachManager,
}

impl TetherSession {
    fn new(device: Arc<dyn TetherDevice>) -> Arc<Self> {
        let manager = AttachManager::new(Arc::new(TetherAttachHook { device }));
        Arc::new(Self { manager })
    }

    fn manager(&self) -> &AttachManager {
        &self.manager
    }
}

#[async_trait]
impl HostSession for TetherSession {
    async fn enumerate_processes(&self) -> Result<Vec<ProcessInfo>> {
        Err(unsupported("enumerate_processes"))
    }

    async fn spawn(&self, _program: &str, _argv: &[String]) -> Result<u32> {
        Err(unsupported("spawn"))
    }

    async fn resume(&self, _pid: u32) -> Result<()> {
        Err(unsupported("resume"))
    }

    async fn kill(&self, _pid: u32) -> Result<()> {
        Err(unsupported("kill"))
    }

    async fn attach_to(&self, pid: u32) -> Result<AgentSessionId> {
        self.manager.attach_to(pid).await
    }

    async fn obtain_agent_session(&self, id: AgentSessionId) -> Result<AgentSessionProxy> {
        self.manager.obtain_agent_session(id)
    }

    fn set_forward_agent_sessions(&self, forward: bool) {
        self.manager.set_forward_agent_sessions(forward);
    }

    async fn close(&self) {
        self.manager.close().await;
    }
}

struct TetherAttachHook {
    device: Arc<dyn TetherDevice>,
}

#[async_trait]
impl AttachHook for TetherAttachHook {
    async fn perform_attach_to(&self, pid: u32) -> Result<(BoxedStream, Box<dyn Transport>)> {
        self.device.open_channel(pid).await
    }
}

fn unsupported(operation: &str) -> SondeError {
    SondeError::failed(format!("{} is not supported for tethered devices", operation))
}
