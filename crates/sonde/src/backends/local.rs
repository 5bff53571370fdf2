//! Local system backend
//!
//! Publishes a single provider for the machine the host runs on. The
//! attach path prepares a scratch data directory, binds the callback and
//! pipe sockets, and hands the pid to the external injector; the injected
//! loader then dials back per the callback handshake and the agent
//! connects on the pipe.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sonde_transport::{
    verify_agent_image, BoxedStream, CallbackListener, Injector, LoaderSpec, Transport,
};
use tokio::net::UnixListener;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::provider::{Icon, Provider, ProviderKind};
use crate::rpc::AgentSessionProxy;
use crate::session::{AgentSessionId, AttachHook, AttachManager, HostSession, ProcessInfo};
use crate::signal::Signal;
use crate::{Result, SondeError};

/// Configuration for the local backend
#[derive(Clone)]
pub struct LocalBackendConfig {
    /// External injector collaborator
    pub injector: Arc<dyn Injector>,
    /// Agent image the loader maps into targets
    pub agent_image: PathBuf,
    /// Optional pinned SHA-256 digest of the agent image
    pub agent_digest: Option<String>,
}

/// Backend publishing the local system provider
pub struct LocalSystemBackend {
    config: LocalBackendConfig,
    provider_available: Signal<Arc<dyn Provider>>,
    provider_unavailable: Signal<Arc<dyn Provider>>,
    provider: Mutex<Option<Arc<LocalProvider>>>,
}

impl LocalSystemBackend {
    /// Create the backend; the provider appears on start
    pub fn new(config: LocalBackendConfig) -> Self {
        Self {
            config,
            provider_available: Signal::new(),
            provider_unavailable: Signal::new(),
            provider: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Backend for LocalSystemBackend {
    async fn start(&self) -> Result<()> {
        let provider = Arc::new(LocalProvider::new(self.config.clone()));
        *self.provider.lock().unwrap() = Some(provider.clone());
        self.provider_available.emit(provider);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let provider = self.provider.lock().unwrap().take();
        if let Some(provider) = provider {
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

/// Provider for the machine the host runs on
pub struct LocalProvider {
    config: LocalBackendConfig,
    session: tokio::sync::Mutex<Option<Arc<LocalSession>>>,
    agent_session_closed: Arc<Signal<(AgentSessionId, Option<String>)>>,
}

impl LocalProvider {
    fn new(config: LocalBackendConfig) -> Self {
        Self {
            config,
            session: tokio::sync::Mutex::new(None),
            agent_session_closed: Arc::new(Signal::new()),
        }
    }

    /// Close the cached session, if one was created
    pub async fn close(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.close().await;
        }
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        "Local System"
    }

    fn icon(&self) -> Option<&Icon> {
        None
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::LocalSystem
    }

    async fn create(&self) -> Result<Arc<dyn HostSession>> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            return Ok(session.clone());
        }

        let session = LocalSession::new(self.config.clone());

        // Surface session deaths on the provider
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

/// Host session for the local system
pub struct LocalSession {
    manager: AttachManager,
}

impl LocalSession {
    /// Create a session backed by the loader/injector attach path
    pub fn new(config: LocalBackendConfig) -> Arc<Self> {
        let manager = AttachManager::new(Arc::new(LocalAttachHook { config }));
        Arc::new(Self { manager })
    }

    /// The embedded attach manager
    pub fn manager(&self) -> &AttachManager {
        &self.manager
    }
}

#[async_trait]
impl HostSession for LocalSession {
    async fn enumerate_processes(&self) -> Result<Vec<ProcessInfo>> {
        local_processes().await
    }

    async fn spawn(&self, program: &str, argv: &[String]) -> Result<u32> {
        let mut command = Command::new(program);
        command
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = command
            .spawn()
            .map_err(|e| SondeError::failed(format!("failed to spawn {}: {}", program, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| SondeError::failed("spawned process exited immediately"))?;

        // Stop the child right away so instrumentation can attach before
        // resume releases it
        send_signal(pid, libc::SIGSTOP)?;

        // Reap the child whenever it finally exits
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        debug!("spawned {} as pid {} (stopped)", program, pid);
        Ok(pid)
    }

    async fn resume(&self, pid: u32) -> Result<()> {
        send_signal(pid, libc::SIGCONT)
    }

    async fn kill(&self, pid: u32) -> Result<()> {
        send_signal(pid, libc::SIGKILL)
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

struct LocalAttachHook {
    config: LocalBackendConfig,
}

#[async_trait]
impl AttachHook for LocalAttachHook {
    async fn perform_attach_to(&self, pid: u32) -> Result<(BoxedStream, Box<dyn Transport>)> {
        if let Some(digest) = &self.config.agent_digest {
            let image = tokio::fs::read(&self.config.agent_image)
                .await
                .map_err(|e| SondeError::failed(format!("failed to read agent image: {}", e)))?;
            verify_agent_image(&image, digest)?;
        }

        let data_dir = tempfile::Builder::new()
            .prefix("sonde-")
            .tempdir()
            .map_err(|e| SondeError::failed(format!("failed to create data dir: {}", e)))?;

        let callback = CallbackListener::bind(data_dir.path())?;

        let pipe_path = data_dir.path().join("pipe");
        let pipe_listener = UnixListener::bind(&pipe_path)
            .map_err(|e| SondeError::failed(format!("failed to bind agent pipe: {}", e)))?;

        let spec = LoaderSpec {
            data_dir: data_dir.path().to_path_buf(),
            agent_image: self.config.agent_image.clone(),
        };
        self.config.injector.inject(pid, &spec).await?;

        let mut loader = callback.accept_loader().await?;
        if loader.pid() != pid {
            warn!(
                "loader announced pid {} while attaching to {}",
                loader.pid(),
                pid
            );
        }

        loader
            .send_pipe_address(&format!("unix:{}", pipe_path.display()))
            .await?;

        let (stream, _) = pipe_listener
            .accept()
            .await
            .map_err(|e| SondeError::failed(format!("agent never dialed the pipe: {}", e)))?;

        loader.permit_resume().await?;

        let transport = LoaderTransport {
            _data_dir: data_dir,
        };
        Ok((Box::new(stream), Box::new(transport)))
    }
}

/// Owner of the loader scratch directory backing one attach
#[derive(Debug)]
struct LoaderTransport {
    _data_dir: tempfile::TempDir,
}

impl Transport for LoaderTransport {
    fn describe(&self) -> &str {
        "loader"
    }
}

#[cfg(target_os = "linux")]
async fn local_processes() -> Result<Vec<ProcessInfo>> {
    let mut processes = Vec::new();

    let mut dir = tokio::fs::read_dir("/proc")
        .await
        .map_err(|e| SondeError::failed(format!("failed to read /proc: {}", e)))?;

    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(|e| SondeError::failed(e.to_string()))?
    {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };

        // The process may exit between readdir and the comm read
        let Ok(comm) = tokio::fs::read_to_string(format!("/proc/{}/comm", pid)).await else {
            continue;
        };
        let name = comm.trim().to_string();
        if name.is_empty() {
            continue;
        }

        processes.push(ProcessInfo { pid, name });
    }

    processes.sort_by_key(|process| process.pid);
    Ok(processes)
}

#[cfg(not(target_os = "linux"))]
async fn local_processes() -> Result<Vec<ProcessInfo>> {
    let output = Command::new("ps")
        .args(["-axo", "pid=,comm="])
        .output()
        .await
        .map_err(|e| SondeError::failed(format!("failed to run ps: {}", e)))?;

    if !output.status.success() {
        return Err(SondeError::failed("ps exited with failure"));
    }

    let mut processes = Vec::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let mut fields = line.trim().splitn(2, ' ');
        let Some(Ok(pid)) = fields.next().map(str::parse::<u32>) else {
            continue;
        };
        let Some(command) = fields.next() else {
            continue;
        };
        let name = command
            .trim()
            .rsplit('/')
            .next()
            .unwrap_or(command)
            .to_string();
        processes.push(ProcessInfo { pid, name });
    }

    processes.sort_by_key(|process| process.pid);
    Ok(processes)
}

fn send_signal(pid: u32, signal: i32) -> Result<()> {
    // SAFETY: plain kill(2) with a constant signal number
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc != 0 {
        return Err(SondeError::failed(format!(
            "kill({}, {}) failed: {}",
            pid,
            signal,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}
