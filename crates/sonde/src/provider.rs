//! Providers: discoverable target systems

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::rpc::AgentSessionProxy;
use crate::session::{AgentSessionId, HostSession};
use crate::signal::Signal;
use crate::Result;

/// Transport family a provider belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// The machine the host is running on
    LocalSystem,
    /// A USB-tethered mobile device
    LocalTether,
    /// A remote machine reached over TCP
    RemoteSystem,
}

/// Opaque provider icon: raw image bytes plus dimensions
#[derive(Debug, Clone)]
pub struct Icon {
    /// Pixel width
    pub width: u32,
    /// Pixel height
    pub height: u32,
    /// Encoded image bytes
    pub data: Bytes,
}

/// One reachable target system
///
/// Created by its owning backend when the underlying target becomes
/// reachable; retracted when it does not. A provider is the factory for
/// the target's [`HostSession`] and reports the death of any of its
/// agent sessions via [`Provider::agent_session_closed`].
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable display name
    fn name(&self) -> &str;

    /// Optional display icon
    fn icon(&self) -> Option<&Icon>;

    /// Transport family
    fn kind(&self) -> ProviderKind;

    /// Get the host session for this target, creating it on first use
    async fn create(&self) -> Result<Arc<dyn HostSession>>;

    /// Resolve an attached agent session by id
    async fn obtain_agent_session(&self, id: AgentSessionId) -> Result<AgentSessionProxy>;

    /// Fired once whenever one of this provider's sessions terminates
    fn agent_session_closed(&self) -> &Signal<(AgentSessionId, Option<String>)>;
}
