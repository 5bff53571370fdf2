//! Service: backend aggregation and lifecycle
//!
//! A service owns an ordered collection of backends and fans their
//! provider events out to its own subscribers, unchanged and without
//! deduplication. Start and stop walk the backends in insertion order.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::info;

use crate::backend::Backend;
#[cfg(unix)]
use crate::backends::local::{LocalBackendConfig, LocalSystemBackend};
use crate::backends::tcp::TcpBackend;
#[cfg(all(unix, not(target_os = "linux")))]
use crate::backends::tether::TetherBackend;
use crate::provider::Provider;
use crate::signal::Signal;
use crate::Result;

struct ServiceShared {
    provider_available: Signal<Arc<dyn Provider>>,
    provider_unavailable: Signal<Arc<dyn Provider>>,
}

struct BackendSlot {
    backend: Arc<dyn Backend>,
    forwarders: Vec<JoinHandle<()>>,
}

/// Aggregator over an ordered collection of backends
pub struct Service {
    shared: Arc<ServiceShared>,
    backends: Mutex<Vec<BackendSlot>>,
}

impl Service {
    /// Create a service with no backends
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ServiceShared {
                provider_available: Signal::new(),
                provider_unavailable: Signal::new(),
            }),
            backends: Mutex::new(Vec::new()),
        }
    }

    /// The default deployment shape: local system, USB tether on
    /// non-Linux hosts, and TCP
    #[cfg(unix)]
    pub fn with_default_backends(config: LocalBackendConfig) -> (Self, DefaultBackends) {
        let service = Self::new();

        let local = Arc::new(LocalSystemBackend::new(config));
        service.add_backend(local.clone());

        #[cfg(not(target_os = "linux"))]
        let tether = {
            let tether = Arc::new(TetherBackend::new());
            service.add_backend(tether.clone());
            tether
        };

        let tcp = Arc::new(TcpBackend::new());
        service.add_backend(tcp.clone());

        (
            service,
            DefaultBackends {
                local,
                #[cfg(not(target_os = "linux"))]
                tether,
                tcp,
            },
        )
    }

    /// Local-system-only deployment shape
    #[cfg(unix)]
    pub fn local_only(config: LocalBackendConfig) -> (Self, Arc<LocalSystemBackend>) {
        let service = Self::new();
        let local = Arc::new(LocalSystemBackend::new(config));
        service.add_backend(local.clone());
        (service, local)
    }

    /// TCP-only deployment shape
    pub fn tcp_only() -> (Self, Arc<TcpBackend>) {
        let service = Self::new();
        let tcp = Arc::new(TcpBackend::new());
        service.add_backend(tcp.clone());
        (service, tcp)
    }

    /// Append a backend and wire its provider events into the service
    ///
    /// Events the backend emits after this point are forwarded unchanged.
    pub fn add_backend(&self, backend: Arc<dyn Backend>) {
        let mut forwarders = Vec::with_capacity(2);

        let shared = self.shared.clone();
        let mut available = backend.provider_available().subscribe();
        forwarders.push(tokio::spawn(async move {
            while let Some(provider) = available.recv().await {
                shared.provider_available.emit(provider);
            }
        }));

        let shared = self.shared.clone();
        let mut unavailable = backend.provider_unavailable().subscribe();
        forwarders.push(tokio::spawn(async move {
            while let Some(provider) = unavailable.recv().await {
                shared.provider_unavailable.emit(provider);
            }
        }));

        self.backends.lock().unwrap().push(BackendSlot {
            backend,
            forwarders,
        });
    }

    /// Remove a backend
    ///
    /// No unavailable events are synthesized for providers the backend
    /// exposed; stop the backend first for tidy teardown.
    pub fn remove_backend(&self, backend: &Arc<dyn Backend>) {
        let mut backends = self.backends.lock().unwrap();
        if let Some(position) = backends
            .iter()
            .position(|slot| Arc::ptr_eq(&slot.backend, backend))
        {
            let slot = backends.remove(position);
            for forwarder in slot.forwarders {
                forwarder.abort();
            }
        }
    }

    /// Start every backend in insertion order
    pub async fn start(&self) -> Result<()> {
        let backends = self.snapshot();
        for backend in backends {
            backend.start().await?;
        }
        info!("service started");
        Ok(())
    }

    /// Stop every backend in insertion order
    pub async fn stop(&self) -> Result<()> {
        let backends = self.snapshot();
        for backend in backends {
            backend.stop().await?;
        }
        info!("service stopped");
        Ok(())
    }

    /// Union of all backends' available events
    pub fn provider_available(&self) -> &Signal<Arc<dyn Provider>> {
        &self.shared.provider_available
    }

    /// Union of all backends' unavailable events
    pub fn provider_unavailable(&self) -> &Signal<Arc<dyn Provider>> {
        &self.shared.provider_unavailable
    }

    fn snapshot(&self) -> Vec<Arc<dyn Backend>> {
        self.backends
            .lock()
            .unwrap()
            .iter()
            .map(|slot| slot.backend.clone())
            .collect()
    }
}

impl Default for Service {
    fn default() -> Self {
        Self::new()
    }
}

/// Typed handles to the backends of the default deployment shape
#[cfg(unix)]
pub struct DefaultBackends {
    /// Local system backend
    pub local: Arc<LocalSystemBackend>,
    /// USB tether backend, absent on Linux hosts
    #[cfg(not(target_os = "linux"))]
    pub tether: Arc<TetherBackend>,
    /// TCP backend
    pub tcp: Arc<TcpBackend>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;
    use async_trait::async_trait;

    struct IdleBackend {
        available: Signal<Arc<dyn Provider>>,
        unavailable: Signal<Arc<dyn Provider>>,
    }

    impl IdleBackend {
        fn new() -> Self {
            Self {
                available: Signal::new(),
                unavailable: Signal::new(),
            }
        }
    }

    #[async_trait]
    impl Backend for IdleBackend {
        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }

        fn provider_available(&self) -> &Signal<Arc<dyn Provider>> {
            &self.available
        }

        fn provider_unavailable(&self) -> &Signal<Arc<dyn Provider>> {
            &self.unavailable
        }
    }

    struct FailingBackend {
        available: Signal<Arc<dyn Provider>>,
        unavailable: Signal<Arc<dyn Provider>>,
    }

    #[async_trait]
    impl Backend for FailingBackend {
        async fn start(&self) -> Result<()> {
            Err(crate::SondeError::failed("usb subsystem unavailable"))
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }

        fn provider_available(&self) -> &Signal<Arc<dyn Provider>> {
            &self.available
        }

        fn provider_unavailable(&self) -> &Signal<Arc<dyn Provider>> {
            &self.unavailable
        }
    }

    #[tokio::test]
    async fn test_quiet_service_lifecycle() {
        // A TCP-only service with nothing registered: start and stop
        // complete, subscribers see zero events
        let (service, _tcp) = Service::tcp_only();
        let mut available = service.provider_available().subscribe();
        let mut unavailable = service.provider_unavailable().subscribe();

        service.start().await.unwrap();
        service.stop().await.unwrap();

        assert!(available.try_recv().is_none());
        assert!(unavailable.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_start_failure_is_surfaced() {
        let service = Service::new();
        service.add_backend(Arc::new(IdleBackend::new()));
        service.add_backend(Arc::new(FailingBackend {
            available: Signal::new(),
            unavailable: Signal::new(),
        }));

        let result = service.start().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_remove_backend_stops_forwarding() {
        let service = Service::new();
        let backend: Arc<dyn Backend> = Arc::new(TcpBackend::new());
        service.add_backend(backend.clone());
        service.remove_backend(&backend);
        assert!(service.backends.lock().unwrap().is_empty());
    }
}
