//! Backend abstraction: one source of providers per transport family

use std::sync::Arc;

use async_trait::async_trait;

use crate::provider::Provider;
use crate::signal::Signal;
use crate::Result;

/// An independent source of provider events
///
/// Backends expose only lifecycle and the two provider signals; everything
/// else about how they watch their transport family is private to them.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Start watching for targets
    async fn start(&self) -> Result<()>;

    /// Stop watching and retract published providers
    async fn stop(&self) -> Result<()>;

    /// Fired when a target becomes reachable
    fn provider_available(&self) -> &Signal<Arc<dyn Provider>>;

    /// Fired when a target becomes unreachable
    fn provider_unavailable(&self) -> &Signal<Arc<dyn Provider>>;
}
