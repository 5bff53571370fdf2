//! RPC connection and typed session proxy
//!
//! One [`RpcConnection`] rides on the byte stream produced by an attach
//! hook. A background task owns the stream: outgoing frames arrive over a
//! channel, incoming frames are correlated back to pending requests or
//! fanned out as events. The connection classifies its own end of life so
//! the session layer can tell a deliberate close from a vanished peer.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use sonde_proto::{object_path, Event, Frame, FrameCodec, Message, Request, Response};
use sonde_transport::BoxedStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::signal::{Signal, Subscription};
use crate::{Result, SondeError};

/// Handle to a script living inside an attached target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgentScriptId(u32);

impl AgentScriptId {
    /// Wrap a raw script id
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw id value
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for AgentScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message emitted by a script inside the target
#[derive(Debug, Clone)]
pub struct ScriptMessage {
    /// Originating script
    pub script: AgentScriptId,
    /// Message body
    pub message: String,
    /// Optional binary payload
    pub data: Option<Bytes>,
}

/// Why a connection ended
#[derive(Debug, Clone)]
pub struct ClosedInfo {
    /// The peer disappeared without announcing a close
    pub remote_peer_vanished: bool,
    /// Failure description, absent for deliberate closes
    pub error: Option<String>,
}

impl ClosedInfo {
    /// True when this end initiated the close
    pub fn closed_by_us(&self) -> bool {
        !self.remote_peer_vanished && self.error.is_none()
    }

    fn local() -> Self {
        Self {
            remote_peer_vanished: false,
            error: None,
        }
    }
}

enum Outbound {
    Frame(Frame),
    Shutdown,
}

#[derive(Debug)]
struct ConnectionShared {
    outbox: mpsc::UnboundedSender<Outbound>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Response>>>,
    closed_tx: watch::Sender<Option<ClosedInfo>>,
    closed_rx: watch::Receiver<Option<ClosedInfo>>,
    events: Signal<Event>,
    script_messages: Signal<ScriptMessage>,
    debug_messages: Signal<String>,
    next_serial: AtomicU32,
    local_close: AtomicBool,
}

/// RPC connection to an in-target agent
#[derive(Debug, Clone)]
pub struct RpcConnection {
    shared: Arc<ConnectionShared>,
}

impl RpcConnection {
    /// Bring up a connection over `stream` and resolve the typed session
    /// interface at the well-known object path.
    ///
    /// Everything here happens inline so a caller-imposed deadline can
    /// cancel the bring-up by dropping the future; the background task
    /// only starts once the handshake has succeeded.
    pub async fn open(mut stream: BoxedStream) -> Result<(RpcConnection, AgentSessionProxy)> {
        let mut codec = FrameCodec::new();

        let open_request = Request::open(object_path::AGENT_SESSION);
        let open_id = open_request.id();
        let payload = encode_message(&Message::request(open_request))?;
        codec.write_frame(&mut stream, &Frame::data(0, payload)).await?;

        loop {
            let frame = match codec.read_frame(&mut stream).await? {
                Some(frame) if frame.is_bye() => {
                    return Err(SondeError::failed("remote closed during bring-up"))
                }
                Some(frame) => frame,
                None => return Err(SondeError::failed("connection closed during bring-up")),
            };

            match decode_message(&frame.payload)? {
                Message::Response(response) if response.request_id() == open_id => match response {
                    Response::Opened { .. } => break,
                    Response::Error { error, .. } => return Err(SondeError::failed(error.message)),
                    other => {
                        return Err(SondeError::failed(format!(
                            "unexpected bring-up response: {:?}",
                            other
                        )))
                    }
                },
                other => {
                    debug!("ignoring pre-open message: {:?}", other);
                }
            }
        }

        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(None);

        let shared = Arc::new(ConnectionShared {
            outbox: outbox_tx,
            pending: Mutex::new(HashMap::new()),
            closed_tx,
            closed_rx,
            events: Signal::new(),
            script_messages: Signal::new(),
            debug_messages: Signal::new(),
            next_serial: AtomicU32::new(1),
            local_close: AtomicBool::new(false),
        });

        tokio::spawn(connection_task(stream, codec, outbox_rx, shared.clone()));

        let connection = RpcConnection { shared };
        let proxy = AgentSessionProxy {
            conn: connection.clone(),
        };
        Ok((connection, proxy))
    }

    /// Send a request and wait for its response
    pub async fn request(&self, request: Request) -> Result<Response> {
        let request_id = request.id();
        let (response_tx, response_rx) = oneshot::channel();

        self.shared
            .pending
            .lock()
            .unwrap()
            .insert(request_id, response_tx);

        let payload = encode_message(&Message::request(request))?;
        let serial = self.shared.next_serial.fetch_add(1, Ordering::Relaxed);

        if self
            .shared
            .outbox
            .send(Outbound::Frame(Frame::data(serial, payload)))
            .is_err()
        {
            self.shared.pending.lock().unwrap().remove(&request_id);
            return Err(SondeError::failed("connection closed"));
        }

        response_rx
            .await
            .map_err(|_| SondeError::failed("connection closed"))
    }

    /// Deliberately close the connection and wait until it is down
    pub async fn close(&self) {
        if !self.shared.local_close.swap(true, Ordering::SeqCst) {
            let serial = self.shared.next_serial.fetch_add(1, Ordering::Relaxed);
            let _ = self.shared.outbox.send(Outbound::Frame(Frame::bye(serial)));
            let _ = self.shared.outbox.send(Outbound::Shutdown);
        }
        self.closed().await;
    }

    /// Wait for the connection to end, however that happens
    pub async fn closed(&self) -> ClosedInfo {
        let mut rx = self.shared.closed_rx.clone();
        loop {
            if let Some(info) = rx.borrow().clone() {
                return info;
            }
            if rx.changed().await.is_err() {
                return ClosedInfo::local();
            }
        }
    }

    /// All asynchronous events from the agent, in arrival order
    pub fn events(&self) -> Subscription<Event> {
        self.shared.events.subscribe()
    }

    pub(crate) fn script_messages(&self) -> Subscription<ScriptMessage> {
        self.shared.script_messages.subscribe()
    }

    pub(crate) fn debug_messages(&self) -> Subscription<String> {
        self.shared.debug_messages.subscribe()
    }
}

async fn connection_task(
    mut stream: BoxedStream,
    mut codec: FrameCodec,
    mut outbox_rx: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<ConnectionShared>,
) {
    let closed_locally = || shared.local_close.load(Ordering::SeqCst);

    let info = loop {
        tokio::select! {
            outbound = outbox_rx.recv() => match outbound {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = codec.write_frame(&mut stream, &frame).await {
                        if closed_locally() {
                            break ClosedInfo::local();
                        }
                        break ClosedInfo {
                            remote_peer_vanished: true,
                            error: Some(e.to_string()),
                        };
                    }
                }
                Some(Outbound::Shutdown) | None => break ClosedInfo::local(),
            },

            frame = codec.read_frame(&mut stream) => match frame {
                Ok(Some(frame)) if frame.is_bye() => {
                    if closed_locally() {
                        break ClosedInfo::local();
                    }
                    break ClosedInfo {
                        remote_peer_vanished: false,
                        error: Some("connection closed by remote peer".to_string()),
                    };
                }
                Ok(Some(frame)) => dispatch_frame(&shared, frame),
                Ok(None) => {
                    if closed_locally() {
                        break ClosedInfo::local();
                    }
                    break ClosedInfo {
                        remote_peer_vanished: true,
                        error: Some("remote peer vanished".to_string()),
                    };
                }
                Err(e) => {
                    if closed_locally() {
                        break ClosedInfo::local();
                    }
                    break ClosedInfo {
                        remote_peer_vanished: true,
                        error: Some(e.to_string()),
                    };
                }
            }
        }
    };

    debug!(
        "agent connection down: vanished={} error={:?}",
        info.remote_peer_vanished, info.error
    );

    // Wake every in-flight request; dropping the senders fails the waits
    shared.pending.lock().unwrap().clear();

    shared.closed_tx.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(info);
            true
        } else {
            false
        }
    });
}

fn dispatch_frame(shared: &Arc<ConnectionShared>, frame: Frame) {
    let message = match decode_message(&frame.payload) {
        Ok(message) => message,
        Err(e) => {
            warn!("dropping undecodable frame {}: {}", frame.serial, e);
            return;
        }
    };

    match message {
        Message::Response(response) => {
            let sender = shared.pending.lock().unwrap().remove(&response.request_id());
            match sender {
                Some(sender) => {
                    let _ = sender.send(response);
                }
                None => warn!("response for unknown request: {}", response.request_id()),
            }
        }
        Message::Event(event) => {
            shared.events.emit(event.clone());
            match event {
                Event::ScriptMessage {
                    script,
                    message,
                    data,
                } => shared.script_messages.emit(ScriptMessage {
                    script: AgentScriptId::new(script),
                    message,
                    data,
                }),
                Event::DebugMessage { message } => shared.debug_messages.emit(message),
            }
        }
        Message::Request(request) => {
            warn!("unexpected request from agent: {}", request.id());
        }
    }
}

fn encode_message(message: &Message) -> Result<Bytes> {
    rmp_serde::to_vec(message)
        .map(Bytes::from)
        .map_err(|e| SondeError::failed(format!("failed to serialize message: {}", e)))
}

fn decode_message(payload: &[u8]) -> Result<Message> {
    rmp_serde::from_slice(payload)
        .map_err(|e| SondeError::failed(format!("failed to deserialize message: {}", e)))
}

/// Typed proxy for the session interface an agent registers at
/// [`object_path::AGENT_SESSION`]
#[derive(Debug, Clone)]
pub struct AgentSessionProxy {
    conn: RpcConnection,
}

impl AgentSessionProxy {
    /// Create a script inside the target
    pub async fn create_script(
        &self,
        name: Option<String>,
        source: &str,
    ) -> Result<AgentScriptId> {
        match self
            .conn
            .request(Request::create_script(name, source))
            .await?
        {
            Response::ScriptCreated { script, .. } => Ok(AgentScriptId::new(script)),
            Response::Error { error, .. } => Err(error.into()),
            other => Err(unexpected(other)),
        }
    }

    /// Destroy a script, waiting for its instrumentation to quiesce
    pub async fn destroy_script(&self, script: AgentScriptId) -> Result<()> {
        self.unit_request(Request::destroy_script(script.as_u32()))
            .await
    }

    /// Load a previously created script
    pub async fn load_script(&self, script: AgentScriptId) -> Result<()> {
        self.unit_request(Request::load_script(script.as_u32()))
            .await
    }

    /// Deliver a message to a script
    pub async fn post_message_to_script(
        &self,
        script: AgentScriptId,
        message: &str,
    ) -> Result<()> {
        self.unit_request(Request::post_script_message(script.as_u32(), message))
            .await
    }

    /// Install the process-wide debug-message hook
    pub async fn enable_debugger(&self) -> Result<()> {
        self.unit_request(Request::enable_debugger()).await
    }

    /// Remove the process-wide debug-message hook
    pub async fn disable_debugger(&self) -> Result<()> {
        self.unit_request(Request::disable_debugger()).await
    }

    /// Deliver a message to the script debugger
    pub async fn post_message_to_debugger(&self, message: &str) -> Result<()> {
        self.unit_request(Request::post_debug_message(message)).await
    }

    /// Liveness probe
    pub async fn ping(&self) -> Result<()> {
        match self.conn.request(Request::ping()).await? {
            Response::Pong { .. } => Ok(()),
            Response::Error { error, .. } => Err(error.into()),
            other => Err(unexpected(other)),
        }
    }

    /// Messages emitted by scripts inside the target
    pub fn message_from_script(&self) -> Subscription<ScriptMessage> {
        self.conn.script_messages()
    }

    /// Messages emitted by the script debugger
    pub fn message_from_debugger(&self) -> Subscription<String> {
        self.conn.debug_messages()
    }

    pub(crate) fn connection(&self) -> &RpcConnection {
        &self.conn
    }

    async fn unit_request(&self, request: Request) -> Result<()> {
        match self.conn.request(request).await? {
            Response::Done { .. } => Ok(()),
            Response::Error { error, .. } => Err(error.into()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> SondeError {
    SondeError::failed(format!("unexpected response: {:?}", response))
}
