//! End-to-end local attach: injector, loader handshake, agent bring-up,
//! and the service/provider layer above it.
//!
//! The fake injector stands in for the native injection collaborator: it
//! speaks the loader's callback protocol and brings up a real agent loop
//! on the pipe, so everything from `attach_to` down runs for real.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use sonde::backends::local::{LocalBackendConfig, LocalSession};
use sonde::transport::callback::{recv_value, send_value};
use sonde::transport::{Injector, LoaderSpec, TransportError};
use sonde::{HostSession, Provider, Service, SondeError};
use sonde_agent::{AgentLoop, LoopbackRuntime, MemoryRange, ScriptEngine};
use tokio::net::UnixStream;

/// Injector that simulates the injected loader instead of mapping one
struct FakeInjector;

#[async_trait]
impl Injector for FakeInjector {
    async fn inject(&self, pid: u32, spec: &LoaderSpec) -> Result<(), TransportError> {
        let callback_path = spec.data_dir.join("callback");

        tokio::spawn(async move {
            // Loader constructor: dial the callback socket and announce
            // the pid
            let mut callback = UnixStream::connect(&callback_path).await.unwrap();
            send_value(&mut callback, &pid.to_string()).await.unwrap();

            // Receive the pipe address and bring the agent up on it
            let pipe_address = recv_value(&mut callback).await.unwrap();
            let pipe_path = pipe_address.strip_prefix("unix:").unwrap().to_string();
            let agent_stream = UnixStream::connect(&pipe_path).await.unwrap();

            let engine = Arc::new(ScriptEngine::new(
                Arc::new(LoopbackRuntime::new()),
                MemoryRange::default(),
            ));
            tokio::spawn(async move {
                let _ = AgentLoop::new(agent_stream, engine).run().await;
            });

            // Permission to resume ends the constructor
            let _ = recv_value(&mut callback).await;
        });

        Ok(())
    }
}

async fn agent_image() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sonde-agent.so");
    tokio::fs::write(&path, b"\x7fELF fake agent image").await.unwrap();
    (dir, path)
}

#[tokio::test]
async fn test_attach_through_the_loader_handshake() {
    let (_dir, image) = agent_image().await;
    let session = LocalSession::new(LocalBackendConfig {
        injector: Arc::new(FakeInjector),
        agent_image: image,
        agent_digest: None,
    });

    let id = session.manager().attach_to(std::process::id()).await.unwrap();
    let agent = session.manager().obtain_agent_session(id).unwrap();

    let script = agent.create_script(Some("hooks".into()), "probe()").await.unwrap();
    agent.load_script(script).await.unwrap();

    let mut messages = agent.message_from_script();
    agent.post_message_to_script(script, "over the pipe").await.unwrap();

    let message = messages.recv().await.unwrap();
    assert_eq!(message.script, script);
    assert_eq!(message.message, "over the pipe");

    session.manager().close().await;
}

#[tokio::test]
async fn test_attach_rejects_tampered_agent_image() {
    let (_dir, image) = agent_image().await;
    let session = LocalSession::new(LocalBackendConfig {
        injector: Arc::new(FakeInjector),
        agent_image: image,
        // Digest of some other build
        agent_digest: Some(
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855".to_string(),
        ),
    });

    let result = session.manager().attach_to(1234).await;
    assert!(matches!(result, Err(SondeError::Failed(_))));
    assert_eq!(session.manager().session_count(), 0);
}

#[tokio::test]
async fn test_service_to_script_roundtrip() {
    let (_dir, image) = agent_image().await;
    let (service, _local) = Service::local_only(LocalBackendConfig {
        injector: Arc::new(FakeInjector),
        agent_image: image,
        agent_digest: None,
    });

    let mut available = service.provider_available().subscribe();
    service.start().await.unwrap();

    let provider = available.recv().await.unwrap();
    assert_eq!(provider.name(), "Local System");

    let host_session = provider.create().await.unwrap();
    let id = host_session.attach_to(4321).await.unwrap();

    // The provider resolves the same session the host session handed out
    let agent = provider.obtain_agent_session(id).await.unwrap();
    let script = agent.create_script(None, "probe()").await.unwrap();
    assert_eq!(script.as_u32(), 1);

    host_session.close().await;
    service.stop().await.unwrap();
}

#[tokio::test]
async fn test_deliberate_close_stays_quiet_at_the_provider() {
    let (_dir, image) = agent_image().await;
    let (service, _local) = Service::local_only(LocalBackendConfig {
        injector: Arc::new(FakeInjector),
        agent_image: image,
        agent_digest: None,
    });

    let mut available = service.provider_available().subscribe();
    service.start().await.unwrap();
    let provider = available.recv().await.unwrap();

    let host_session = provider.create().await.unwrap();
    let mut closed = provider.agent_session_closed().subscribe();

    let id = host_session.attach_to(5555).await.unwrap();
    let agent = provider.obtain_agent_session(id).await.unwrap();
    agent.ping().await.unwrap();

    host_session.close().await;

    tokio::task::yield_now().await;
    assert!(closed.try_recv().is_none());

    service.stop().await.unwrap();
}
