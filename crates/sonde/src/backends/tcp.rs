//! TCP remote-endpoint backend
//!
//! Remote endpoints are exported agent sessions reachable over TCP,
//! typically the loopback re-export listeners of another host. Endpoints
//! are added and removed at runtime; each becomes a provider while the
//! backend runs.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sonde_transport::{BoxedStream, NullTransport, Transport};
use tokio::net::TcpStream;
use tracing::debug;

use crate::backend::Backend;
use crate::provider::{Icon, Provider, ProviderKind};
use crate::rpc::AgentSessionProxy;
use crate::session::{AgentSessionId, AttachHook, AttachManager, HostSession, ProcessInfo};
use crate::signal::Signal;
use crate::{Result, SondeError};

/// Backend publishing one provider per registered TCP endpoint
pub struct TcpBackend {
    provider_available: Signal<Arc<dyn Provider>>,
    provider_unavailable: Signal<Arc<dyn Provider>>,
    endpoints: Mutex<HashMap<SocketAddr, Arc<TcpProvider>>>,
    running: AtomicBool,
}

impl TcpBackend {
    /// Create the backend with no endpoints
    pub fn new() -> Self {
        Self {
            provider_available: Signal::new(),
            provider_unavailable: Signal::new(),
            endpoints: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Register a remote endpoint; announced immediately when running
    pub fn add_endpoint(&self, name: impl Into<String>, address: SocketAddr) {
        let provider = Arc::new(TcpProvider::new(name.into(), address));
        self.endpoints.lock().unwrap().insert(address, provider.clone());

        if self.running.load(Ordering::SeqCst) {
            self.provider_available.emit(provider);
        }
    }

    /// Forget a remote endpoint; retracted immediately when running
    pub fn remove_endpoint(&self, address: SocketAddr) {
        let provider = self.endpoints.lock().unwrap().remove(&address);
        if let Some(provider) = provider {
            if self.running.load(Ordering::SeqCst) {
                self.provider_unavailable.emit(provider);
            }
        }
    }
}

impl Default for TcpBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for TcpBackend {
    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        let providers: Vec<Arc<TcpProvider>> =
            self.endpoints.lock().unwrap().values().cloned().collect();
        for provider in providers {
            self.provider_available.emit(provider);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);

        let providers: Vec<Arc<TcpProvider>> =
            self.endpoints.lock().unwrap().values().cloned().collect();
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

/// Provider for one remote TCP endpoint
pub struct TcpProvider {
    name: String,
    address: SocketAddr,
    session: tokio::sync::Mutex<Option<Arc<TcpSession>>>,
    agent_session_closed: Arc<Signal<(AgentSessionId, Option<String>)>>,
}

impl TcpProvider {
    fn new(name: String, address: SocketAddr) -> Self {
        Self {
            name,
            address,
            session: tokio::sync::Mutex::new(None),
            agent_session_closed: Arc::new(Signal::new()),
        }
    }

    /// Endpoint address
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    async fn close(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.close().await;
        }
    }
}

#[async_trait]
impl Provider for TcpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn icon(&self) -> Option<&Icon> {
        None
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::RemoteSystem
    }

    async fn create(&self) -> Result<Arc<dyn HostSession>> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            return Ok(session.clone());
        }

        let session = TcpSession::new(self.address);

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

/// Host session for a remote TCP endpoint
///
/// Only the attach/obtain pair is available; process operations belong to
/// the remote host's own control plane.
pub struct TcpSession {
    manager: AttachManager,
    address: SocketAddr,
}

impl TcpSession {
    /// Create a session dialing `address` on attach
    pub fn new(address: SocketAddr) -> Arc<Self> {
        let manager = AttachManager::new(Arc::new(TcpAttachHook { address }));
        Arc::new(Self { manager, address })
    }

    /// The embedded attach manager
    pub fn manager(&self) -> &AttachManager {
        &self.manager
    }
}

#[async_trait]
impl HostSession for TcpSession {
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

struct TcpAttachHook {
    address: SocketAddr,
}

#[async_trait]
impl AttachHook for TcpAttachHook {
    async fn perform_attach_to(&self, pid: u32) -> Result<(BoxedStream, Box<dyn Transport>)> {
        debug!("dialing {} for pid {}", self.address, pid);

        let stream = TcpStream::connect(self.address)
            .await
            .map_err(|e| SondeError::failed(format!("failed to reach {}: {}", self.address, e)))?;

        Ok((Box::new(stream), Box::new(NullTransport)))
    }
}

fn unsupported(operation: &str) -> SondeError {
    SondeError::failed(format!("{} is not supported for remote endpoints", operation))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_endpoints_announced_only_while_running() {
        let backend = TcpBackend::new();
        let mut available = backend.provider_available().subscribe();

        let address: SocketAddr = "127.0.0.1:7007".parse().unwrap();
        backend.add_endpoint("build box", address);
        assert!(available.try_recv().is_none());

        backend.start().await.unwrap();
        let provider = available.recv().await.unwrap();
        assert_eq!(provider.name(), "build box");
        assert_eq!(provider.kind(), ProviderKind::RemoteSystem);
    }

    #[tokio::test]
    async fn test_remove_endpoint_retracts_provider() {
        let backend = TcpBackend::new();
        backend.start().await.unwrap();

        let mut available = backend.provider_available().subscribe();
        let mut unavailable = backend.provider_unavailable().subscribe();

        let address: SocketAddr = "127.0.0.1:7008".parse().unwrap();
        backend.add_endpoint("lab", address);
        assert_eq!(available.recv().await.unwrap().name(), "lab");

        backend.remove_endpoint(address);
        assert_eq!(unavailable.recv().await.unwrap().name(), "lab");
    }

    #[tokio::test]
    async fn test_attach_to_unreachable_endpoint() {
        // A port nothing listens on; connect must fail, not hang
        let session = TcpSession::new("127.0.0.1:1".parse().unwrap());
        let result = session.attach_to(1234).await;
        assert!(matches!(result, Err(SondeError::Failed(_))));
    }

    #[tokio::test]
    async fn test_process_operations_unsupported() {
        let session = TcpSession::new("127.0.0.1:1".parse().unwrap());
        assert!(matches!(
            session.enumerate_processes().await,
            Err(SondeError::Failed(_))
        ));
        assert!(matches!(
            session.spawn("ls", &[]).await,
            Err(SondeError::Failed(_))
        ));
    }
}
