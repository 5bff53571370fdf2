//! Attach session management
//!
//! [`AttachManager`] is the reusable attach/obtain/close state machine;
//! session backends supply only [`AttachHook::perform_attach_to`], which
//! yields the byte stream to the in-target agent plus the opaque owner
//! keeping that stream usable. Each successful attach becomes a
//! [`SessionEntry`] holding the transport, the RPC connection, the typed
//! proxy, and (in forwarding mode) the loopback re-export server.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sonde_transport::{BoxedStream, Transport};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::reexport::ReexportServer;
use crate::rpc::{AgentSessionProxy, ClosedInfo, RpcConnection};
use crate::signal::Signal;
use crate::{Result, SondeError};

/// Base value for agent session ids, and the first port probed when
/// sessions are re-exported on loopback
pub const DEFAULT_AGENT_PORT: u16 = 27043;

/// Deadline for the RPC bring-up once the transport is acquired
const BRING_UP_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Handle to one attached agent session
///
/// In forwarding mode the value doubles as the loopback TCP port the
/// session is re-exported on; otherwise it is purely an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgentSessionId(u32);

impl AgentSessionId {
    /// Wrap a raw id
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw id value
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// The id interpreted as a loopback port (forwarding mode only)
    pub fn port(self) -> u16 {
        self.0 as u16
    }
}

impl fmt::Display for AgentSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One process visible to a host session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Process id
    pub pid: u32,
    /// Executable name
    pub name: String,
}

/// Per-target operations exposed by a provider's session
#[async_trait]
pub trait HostSession: Send + Sync {
    /// List processes running on the target
    async fn enumerate_processes(&self) -> Result<Vec<ProcessInfo>>;

    /// Spawn a program on the target, stopped until [`HostSession::resume`]
    async fn spawn(&self, program: &str, argv: &[String]) -> Result<u32>;

    /// Let a spawned (or stopped) process run
    async fn resume(&self, pid: u32) -> Result<()>;

    /// Kill a process
    async fn kill(&self, pid: u32) -> Result<()>;

    /// Attach to a process and return its agent session id
    async fn attach_to(&self, pid: u32) -> Result<AgentSessionId>;

    /// Resolve an attached agent session by id
    async fn obtain_agent_session(&self, id: AgentSessionId) -> Result<AgentSessionProxy>;

    /// Whether new attaches are re-exported on loopback. Read once per
    /// [`HostSession::attach_to`]; flipping it never touches live entries.
    fn set_forward_agent_sessions(&self, forward: bool);

    /// Close every session and release the target
    async fn close(&self);
}

/// Transport acquisition hook supplied by each session backend
#[async_trait]
pub trait AttachHook: Send + Sync {
    /// Produce the agent byte stream for `pid` plus the owner object that
    /// must stay alive at least as long as the stream
    async fn perform_attach_to(&self, pid: u32) -> Result<(BoxedStream, Box<dyn Transport>)>;
}

type AttachOutcome = std::result::Result<u32, SondeError>;

enum Claim {
    Existing(u32),
    Join(watch::Receiver<Option<AttachOutcome>>),
    Lead(watch::Sender<Option<AttachOutcome>>),
}

#[derive(Default)]
struct Table {
    entries: HashMap<u32, Arc<SessionEntry>>,
    by_pid: HashMap<u32, u32>,
    pending: HashMap<u32, watch::Receiver<Option<AttachOutcome>>>,
}

struct ManagerInner {
    hook: Arc<dyn AttachHook>,
    forward_agent_sessions: AtomicBool,
    next_session_id: AtomicU32,
    state: Mutex<Table>,
    agent_session_closed: Signal<(AgentSessionId, Option<String>)>,
}

/// Reusable attach/obtain/close implementation
///
/// Embed one per session backend; the backend supplies the
/// [`AttachHook`], the manager owns the session table.
#[derive(Clone)]
pub struct AttachManager {
    inner: Arc<ManagerInner>,
}

impl AttachManager {
    /// Create a manager around an attach hook
    pub fn new(hook: Arc<dyn AttachHook>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                hook,
                forward_agent_sessions: AtomicBool::new(false),
                next_session_id: AtomicU32::new(DEFAULT_AGENT_PORT as u32),
                state: Mutex::new(Table::default()),
                agent_session_closed: Signal::new(),
            }),
        }
    }

    /// Whether new attaches are re-exported on loopback
    pub fn forward_agent_sessions(&self) -> bool {
        self.inner.forward_agent_sessions.load(Ordering::SeqCst)
    }

    /// Set the forwarding flag; read once per attach
    pub fn set_forward_agent_sessions(&self, forward: bool) {
        self.inner
            .forward_agent_sessions
            .store(forward, Ordering::SeqCst);
    }

    /// Fired once per terminated session, after the entry has left the
    /// table
    pub fn agent_session_closed(&self) -> &Signal<(AgentSessionId, Option<String>)> {
        &self.inner.agent_session_closed
    }

    /// Number of live entries
    pub fn session_count(&self) -> usize {
        self.inner.state.lock().unwrap().entries.len()
    }

    #[cfg(test)]
    pub(crate) fn entry(&self, id: AgentSessionId) -> Option<Arc<SessionEntry>> {
        self.inner
            .state
            .lock()
            .unwrap()
            .entries
            .get(&id.as_u32())
            .cloned()
    }

    /// Attach to `pid`, reusing the existing session when there is one
    ///
    /// Concurrent callers for the same pid funnel through a single
    /// in-flight attach and all observe the same outcome.
    pub async fn attach_to(&self, pid: u32) -> Result<AgentSessionId> {
        let forward = self.forward_agent_sessions();

        let claim = {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(&id) = state.by_pid.get(&pid) {
                Claim::Existing(id)
            } else if let Some(rx) = state.pending.get(&pid) {
                Claim::Join(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                state.pending.insert(pid, rx);
                Claim::Lead(tx)
            }
        };

        match claim {
            Claim::Existing(id) => Ok(AgentSessionId(id)),
            Claim::Join(mut rx) => loop {
                let outcome = rx.borrow().clone();
                if let Some(outcome) = outcome {
                    return outcome.map(AgentSessionId);
                }
                rx.changed()
                    .await
                    .map_err(|_| SondeError::failed("attach cancelled"))?;
            },
            Claim::Lead(tx) => {
                // The pending slot must clear however this ends, even if
                // the caller drops the future mid-attach
                struct PendingGuard {
                    inner: Arc<ManagerInner>,
                    pid: u32,
                }
                impl Drop for PendingGuard {
                    fn drop(&mut self) {
                        self.inner.state.lock().unwrap().pending.remove(&self.pid);
                    }
                }
                let _guard = PendingGuard {
                    inner: self.inner.clone(),
                    pid,
                };

                let outcome = self.lead_attach(pid, forward).await;
                let shared = outcome.as_ref().map(|id| id.as_u32()).map_err(Clone::clone);
                let _ = tx.send(Some(shared));
                outcome
            }
        }
    }

    /// Resolve an attached session by id
    pub fn obtain_agent_session(&self, id: AgentSessionId) -> Result<AgentSessionProxy> {
        let state = self.inner.state.lock().unwrap();
        state
            .entries
            .get(&id.as_u32())
            .and_then(|entry| entry.agent_session())
            .ok_or(SondeError::NotFound)
    }

    /// Close every entry and clear the table
    pub async fn close(&self) {
        let entries: Vec<Arc<SessionEntry>> = {
            let mut state = self.inner.state.lock().unwrap();
            state.by_pid.clear();
            state.pending.clear();
            state.entries.drain().map(|(_, entry)| entry).collect()
        };

        for entry in entries {
            entry.close().await;
        }
    }

    async fn lead_attach(&self, pid: u32, forward: bool) -> Result<AgentSessionId> {
        debug!("attaching to pid {}", pid);

        let (stream, transport) = self.inner.hook.perform_attach_to(pid).await?;

        let (connection, agent_session) =
            match timeout(BRING_UP_TIMEOUT, RpcConnection::open(stream)).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return Err(SondeError::failed(e.to_string())),
                Err(_) => {
                    // The in-flight bring-up was cancelled by dropping it;
                    // callers observe the deadline, not the cancellation
                    debug!("bring-up for pid {} cancelled after {:?}", pid, BRING_UP_TIMEOUT);
                    return Err(SondeError::TimedOut);
                }
            };

        let id = if forward {
            self.allocate_port().await?
        } else {
            AgentSessionId(self.inner.next_session_id.fetch_add(1, Ordering::SeqCst))
        };

        let entry = Arc::new(SessionEntry::new(
            id,
            pid,
            transport,
            connection.clone(),
            agent_session,
        ));

        // Route the connection's closed event through the manager by id;
        // the weak reference breaks the entry/manager cycle
        let weak = Arc::downgrade(&self.inner);
        let closed_connection = connection;
        tokio::spawn(async move {
            let reason = closed_connection.closed().await;
            if let Some(inner) = weak.upgrade() {
                ManagerInner::on_connection_closed(&inner, id, reason);
            }
        });

        {
            let mut state = self.inner.state.lock().unwrap();
            state.entries.insert(id.as_u32(), entry.clone());
            state.by_pid.insert(pid, id.as_u32());
        }

        if forward {
            let address = SocketAddr::from((Ipv4Addr::LOCALHOST, id.port()));
            if let Err(e) = entry.serve(address).await {
                warn!("failed to re-export session {}: {}", id, e);
                {
                    let mut state = self.inner.state.lock().unwrap();
                    state.entries.remove(&id.as_u32());
                    state.by_pid.remove(&pid);
                }
                entry.close().await;
                return Err(SondeError::failed(e.to_string()));
            }
        }

        info!("attached to pid {} as session {}", pid, id);
        Ok(id)
    }

    /// Find the smallest loopback port from [`DEFAULT_AGENT_PORT`] that no
    /// live entry uses and that is currently bindable
    async fn allocate_port(&self) -> Result<AgentSessionId> {
        let in_use: HashSet<u32> = {
            let state = self.inner.state.lock().unwrap();
            state.entries.keys().copied().collect()
        };

        let mut port = DEFAULT_AGENT_PORT as u32;
        while port <= u16::MAX as u32 {
            if in_use.contains(&port) {
                port += 1;
                continue;
            }

            match TcpListener::bind((Ipv4Addr::LOCALHOST, port as u16))
                .await
                .map_err(SondeError::from)
            {
                Ok(listener) => {
                    drop(listener);
                    // Keep identifier-mode allocation ahead of probed
                    // ports so ids stay unique if the flag ever flips
                    self.inner
                        .next_session_id
                        .fetch_max(port + 1, Ordering::SeqCst);
                    return Ok(AgentSessionId(port));
                }
                Err(SondeError::AddressInUse) => port += 1,
                Err(e) => {
                    return Err(SondeError::failed(format!("port probe failed: {}", e)));
                }
            }
        }

        Err(SondeError::failed("no loopback port available for re-export"))
    }
}

impl ManagerInner {
    fn on_connection_closed(inner: &Arc<ManagerInner>, id: AgentSessionId, reason: ClosedInfo) {
        if reason.closed_by_us() {
            // The initiating path owns the cleanup
            return;
        }

        let entry = {
            let mut state = inner.state.lock().unwrap();
            let entry = state.entries.remove(&id.as_u32());
            if let Some(entry) = &entry {
                state.by_pid.remove(&entry.pid());
            }
            entry
        };

        let Some(entry) = entry else {
            debug_assert!(false, "closed event for unknown session {}", id);
            return;
        };

        debug!("session {} lost: {:?}", id, reason.error);
        tokio::spawn(async move {
            entry.close().await;
        });
        inner.agent_session_closed.emit((id, reason.error));
    }
}

enum CloseRole {
    Done,
    Wait(watch::Receiver<bool>),
    Lead(watch::Sender<bool>),
}

enum CloseState {
    Open,
    Closing(watch::Receiver<bool>),
    Closed,
}

/// One attached session: transport, RPC connection, typed proxy, and the
/// optional re-export server with its clients
pub struct SessionEntry {
    id: AgentSessionId,
    pid: u32,
    connection: RpcConnection,
    agent_session: Mutex<Option<AgentSessionProxy>>,
    reexport: Mutex<Option<ReexportServer>>,
    close_state: Mutex<CloseState>,
    // Kept for the entry's whole lifetime; must not be released before
    // the connection is closed, which field order guarantees on drop
    _transport: Box<dyn Transport>,
}

impl SessionEntry {
    fn new(
        id: AgentSessionId,
        pid: u32,
        transport: Box<dyn Transport>,
        connection: RpcConnection,
        agent_session: AgentSessionProxy,
    ) -> Self {
        debug!("session {} rides on {} transport", id, transport.describe());
        Self {
            id,
            pid,
            connection,
            agent_session: Mutex::new(Some(agent_session)),
            reexport: Mutex::new(None),
            close_state: Mutex::new(CloseState::Open),
            _transport: transport,
        }
    }

    /// Session id
    pub fn id(&self) -> AgentSessionId {
        self.id
    }

    /// Target pid
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The typed proxy, until `close()` releases it
    pub fn agent_session(&self) -> Option<AgentSessionProxy> {
        self.agent_session.lock().unwrap().clone()
    }

    /// Start the loopback re-export server for this entry
    pub(crate) async fn serve(self: &Arc<Self>, address: SocketAddr) -> Result<()> {
        let proxy = self
            .agent_session()
            .ok_or_else(|| SondeError::failed("session is closing"))?;

        let weak = Arc::downgrade(self);
        let on_fatal: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            if let Some(entry) = weak.upgrade() {
                tokio::spawn(async move {
                    entry.close().await;
                });
            }
        });

        let server = ReexportServer::start(address, proxy, on_fatal).await?;
        debug!(
            "session {} re-exported at {} (guid {})",
            self.id,
            server.local_addr(),
            server.guid()
        );
        *self.reexport.lock().unwrap() = Some(server);
        Ok(())
    }

    /// Tear the entry down; idempotent
    ///
    /// The first caller runs the teardown, every other caller awaits the
    /// same completion latch. After this returns no callback referencing
    /// the entry fires again.
    pub async fn close(&self) {
        let role = {
            let mut state = self.close_state.lock().unwrap();
            match &*state {
                CloseState::Closed => CloseRole::Done,
                CloseState::Closing(rx) => CloseRole::Wait(rx.clone()),
                CloseState::Open => {
                    let (tx, rx) = watch::channel(false);
                    *state = CloseState::Closing(rx);
                    CloseRole::Lead(tx)
                }
            }
        };

        match role {
            CloseRole::Done => {}
            CloseRole::Wait(mut rx) => loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            },
            CloseRole::Lead(tx) => {
                debug!("closing session {}", self.id);

                // Stop the re-export server and drop its clients and
                // registrations; per-client errors are swallowed
                let server = self.reexport.lock().unwrap().take();
                if let Some(server) = server {
                    server.stop().await;
                }

                // Release the typed proxy
                self.agent_session.lock().unwrap().take();

                // Close the agent connection, ignoring errors
                self.connection.close().await;

                *self.close_state.lock().unwrap() = CloseState::Closed;
                let _ = tx.send(true);
            }
        }
    }
}
