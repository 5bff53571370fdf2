//! RPC service loop
//!
//! Reads request frames from the host stream, dispatches them to the
//! script engine, and pushes engine events back out over the same stream.
//! The loop ends when the host says goodbye or the stream dies; either
//! way the engine is shut down before returning.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use sonde_proto::message::{ErrorCode, ErrorDetails};
use sonde_proto::{object_path, Event, Frame, FrameCodec, Message, Request, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{EngineMessage, ScriptEngine};
use crate::AgentError;

/// Agent service loop over one host stream
pub struct AgentLoop<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    stream: S,
    engine: Arc<ScriptEngine>,
}

impl<S> AgentLoop<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create a loop servicing `engine` over `stream`
    pub fn new(stream: S, engine: Arc<ScriptEngine>) -> Self {
        Self { stream, engine }
    }

    /// Run until the host disconnects
    pub async fn run(self) -> Result<()> {
        let Self { mut stream, engine } = self;
        let mut codec = FrameCodec::new();
        let mut serial: u32 = 1;

        let mut script_messages = engine.message_from_script();
        let mut debug_messages = engine.message_from_debugger();

        info!("agent loop started");

        loop {
            tokio::select! {
                frame = codec.read_frame(&mut stream) => match frame {
                    Ok(Some(frame)) if frame.is_bye() => {
                        debug!("host closed the session");
                        break;
                    }
                    Ok(Some(frame)) => {
                        let Some(response) = handle_frame(&engine, frame).await else {
                            continue;
                        };
                        let payload = rmp_serde::to_vec(&Message::response(response))
                            .context("failed to serialize response")?;
                        let frame = Frame::data(next_serial(&mut serial), Bytes::from(payload));
                        codec
                            .write_frame(&mut stream, &frame)
                            .await
                            .context("failed to write response frame")?;
                    }
                    Ok(None) => {
                        info!("host stream closed");
                        break;
                    }
                    Err(e) => {
                        warn!("failed to read frame: {}", e);
                        break;
                    }
                },

                message = script_messages.recv() => {
                    if let Some(EngineMessage { script, message, data }) = message {
                        let event = Event::ScriptMessage { script, message, data };
                        let payload = rmp_serde::to_vec(&Message::event(event))
                            .context("failed to serialize script message")?;
                        let frame = Frame::data(next_serial(&mut serial), Bytes::from(payload));
                        codec
                            .write_frame(&mut stream, &frame)
                            .await
                            .context("failed to push script message")?;
                    }
                },

                message = debug_messages.recv() => {
                    if let Some(message) = message {
                        let event = Event::DebugMessage { message };
                        let payload = rmp_serde::to_vec(&Message::event(event))
                            .context("failed to serialize debug message")?;
                        let frame = Frame::data(next_serial(&mut serial), Bytes::from(payload));
                        codec
                            .write_frame(&mut stream, &frame)
                            .await
                            .context("failed to push debug message")?;
                    }
                }
            }
        }

        engine.shutdown().await;
        info!("agent loop stopped");
        Ok(())
    }
}

fn next_serial(serial: &mut u32) -> u32 {
    let current = *serial;
    *serial = serial.wrapping_add(1);
    current
}

async fn handle_frame(engine: &ScriptEngine, frame: Frame) -> Option<Response> {
    let message = match rmp_serde::from_slice::<Message>(&frame.payload) {
        Ok(message) => message,
        Err(e) => {
            warn!("dropping undecodable frame {}: {}", frame.serial, e);
            return None;
        }
    };

    match message {
        Message::Request(request) => Some(handle_request(engine, request).await),
        other => {
            warn!("unexpected message from host: {:?}", other);
            None
        }
    }
}

async fn handle_request(engine: &ScriptEngine, request: Request) -> Response {
    match request {
        Request::Open { id, path } => {
            if path == object_path::AGENT_SESSION {
                Response::Opened { request_id: id }
            } else {
                Response::error(
                    id,
                    ErrorDetails::new(ErrorCode::NotFound, format!("no object at {}", path)),
                )
            }
        }
        Request::CreateScript { id, name, source } => {
            match engine.create_script(name.as_deref(), &source).await {
                Ok(script) => Response::ScriptCreated {
                    request_id: id,
                    script,
                },
                Err(e) => failure(id, e),
            }
        }
        Request::DestroyScript { id, script } => ack(id, engine.destroy_script(script).await),
        Request::LoadScript { id, script } => ack(id, engine.load_script(script).await),
        Request::PostScriptMessage {
            id,
            script,
            message,
        } => ack(id, engine.post_message_to_script(script, &message).await),
        Request::EnableDebugger { id } => {
            engine.enable_debugger();
            Response::done(id)
        }
        Request::DisableDebugger { id } => {
            engine.disable_debugger();
            Response::done(id)
        }
        Request::PostDebugMessage { id, message } => {
            engine.post_message_to_debugger(&message).await;
            Response::done(id)
        }
        Request::Ping { id } => Response::Pong { request_id: id },
    }
}

fn ack(id: Uuid, result: std::result::Result<(), AgentError>) -> Response {
    match result {
        Ok(()) => Response::done(id),
        Err(e) => failure(id, e),
    }
}

fn failure(id: Uuid, error: AgentError) -> Response {
    Response::error(id, ErrorDetails::new(ErrorCode::Failed, error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackRuntime;
    use crate::runtime::MemoryRange;
    use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};

    fn spawn_agent() -> DuplexStream {
        let (host_side, agent_side) = tokio::io::duplex(64 * 1024);
        let engine = Arc::new(ScriptEngine::new(
            Arc::new(LoopbackRuntime::new()),
            MemoryRange::default(),
        ));
        tokio::spawn(async move {
            let _ = AgentLoop::new(agent_side, engine).run().await;
        });
        host_side
    }

    async fn send_request<S>(codec: &mut FrameCodec, stream: &mut S, request: Request) -> Response
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request_id = request.id();
        let payload = rmp_serde::to_vec(&Message::request(request)).unwrap();
        codec
            .write_frame(stream, &Frame::data(0, Bytes::from(payload)))
            .await
            .unwrap();

        loop {
            let frame = codec.read_frame(stream).await.unwrap().unwrap();
            match rmp_serde::from_slice::<Message>(&frame.payload).unwrap() {
                Message::Response(response) if response.request_id() == request_id => {
                    return response;
                }
                Message::Event(_) => continue,
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_open_resolves_well_known_path() {
        let mut stream = spawn_agent();
        let mut codec = FrameCodec::new();

        let response = send_request(
            &mut codec,
            &mut stream,
            Request::open(object_path::AGENT_SESSION),
        )
        .await;
        assert!(matches!(response, Response::Opened { .. }));
    }

    #[tokio::test]
    async fn test_open_unknown_path() {
        let mut stream = spawn_agent();
        let mut codec = FrameCodec::new();

        let response = send_request(&mut codec, &mut stream, Request::open("/nowhere")).await;
        match response {
            Response::Error { error, .. } => assert_eq!(error.code, ErrorCode::NotFound),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_script_lifecycle_over_rpc() {
        let mut stream = spawn_agent();
        let mut codec = FrameCodec::new();

        let response = send_request(
            &mut codec,
            &mut stream,
            Request::create_script(None, "probe()"),
        )
        .await;
        let sid = match response {
            Response::ScriptCreated { script, .. } => script,
            other => panic!("unexpected response: {:?}", other),
        };
        assert_eq!(sid, 1);

        let response = send_request(&mut codec, &mut stream, Request::load_script(sid)).await;
        assert!(matches!(response, Response::Done { .. }));

        let response = send_request(&mut codec, &mut stream, Request::destroy_script(sid)).await;
        assert!(matches!(response, Response::Done { .. }));

        // A second destroy reports the spec'd failure message
        let response = send_request(&mut codec, &mut stream, Request::destroy_script(sid)).await;
        match response {
            Response::Error { error, .. } => {
                assert_eq!(error.code, ErrorCode::Failed);
                assert_eq!(error.message, "invalid script id");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_script_message_events_reach_host() {
        let mut stream = spawn_agent();
        let mut codec = FrameCodec::new();

        let sid = match send_request(
            &mut codec,
            &mut stream,
            Request::create_script(None, "probe()"),
        )
        .await
        {
            Response::ScriptCreated { script, .. } => script,
            other => panic!("unexpected response: {:?}", other),
        };
        send_request(&mut codec, &mut stream, Request::load_script(sid)).await;
        send_request(
            &mut codec,
            &mut stream,
            Request::post_script_message(sid, "echo me"),
        )
        .await;

        loop {
            let frame = codec.read_frame(&mut stream).await.unwrap().unwrap();
            match rmp_serde::from_slice::<Message>(&frame.payload).unwrap() {
                Message::Event(Event::ScriptMessage {
                    script, message, ..
                }) => {
                    assert_eq!(script, sid);
                    assert_eq!(message, "echo me");
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_ping() {
        let mut stream = spawn_agent();
        let mut codec = FrameCodec::new();

        let response = send_request(&mut codec, &mut stream, Request::ping()).await;
        assert!(matches!(response, Response::Pong { .. }));
    }
}
