//! Loopback re-export of attached agent sessions
//!
//! In forwarding mode every attached session is served again on
//! `127.0.0.1:<id>` so external clients can drive the same agent session
//! over TCP. The listener binds loopback only and accepts anonymous
//! clients; each accepted connection gets the session object registered
//! at the well-known path and sees the same requests, responses, and
//! events as the in-process proxy.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use sonde_proto::message::{ErrorCode, ErrorDetails};
use sonde_proto::{object_path, Frame, FrameCodec, Message, Request, Response};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::rpc::AgentSessionProxy;
use crate::{Result, SondeError};

type FatalHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ClientTable {
    next_client: u64,
    next_token: u64,
    clients: HashMap<u64, JoinHandle<()>>,
    /// Registration token for the session object, per client connection
    registrations: HashMap<u64, u64>,
}

impl ClientTable {
    fn register_session_object(&mut self, client: u64) -> std::result::Result<u64, String> {
        if self.registrations.contains_key(&client) {
            return Err(format!(
                "object already registered at {} for client {}",
                object_path::AGENT_SESSION,
                client
            ));
        }
        self.next_token += 1;
        self.registrations.insert(client, self.next_token);
        Ok(self.next_token)
    }
}

/// Server re-exporting one agent session on loopback
pub(crate) struct ReexportServer {
    guid: Uuid,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    clients: Arc<Mutex<ClientTable>>,
}

impl ReexportServer {
    /// Bind `address` and start accepting clients
    pub(crate) async fn start(
        address: SocketAddr,
        proxy: AgentSessionProxy,
        on_fatal: FatalHandler,
    ) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| SondeError::failed(format!("failed to bind {}: {}", address, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SondeError::failed(e.to_string()))?;

        let guid = Uuid::new_v4();
        let clients = Arc::new(Mutex::new(ClientTable::default()));

        debug!("re-exporting agent session at {} (guid {})", local_addr, guid);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            proxy,
            guid,
            clients.clone(),
            on_fatal,
        ));

        Ok(Self {
            guid,
            local_addr,
            accept_task,
            clients,
        })
    }

    /// Server GUID, freshly generated per session
    pub(crate) fn guid(&self) -> Uuid {
        self.guid
    }

    /// Bound address
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, drop every client, clear the registrations
    pub(crate) async fn stop(self) {
        self.accept_task.abort();

        let handles: Vec<JoinHandle<()>> = {
            let mut table = self.clients.lock().unwrap();
            table.registrations.clear();
            table.clients.drain().map(|(_, handle)| handle).collect()
        };

        for handle in handles {
            handle.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    proxy: AgentSessionProxy,
    guid: Uuid,
    clients: Arc<Mutex<ClientTable>>,
    on_fatal: FatalHandler,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("re-export accept failed: {}", e);
                continue;
            }
        };

        debug!("re-export client {} connected (guid {})", peer, guid);

        let client = {
            let mut table = clients.lock().unwrap();
            table.next_client += 1;
            let client = table.next_client;

            match table.register_session_object(client) {
                Ok(token) => {
                    debug!("registered session object for client {} (token {})", client, token);
                }
                Err(e) => {
                    warn!("object registration failed for client {}: {}", peer, e);
                    drop(table);
                    on_fatal();
                    continue;
                }
            }
            client
        };

        let handle = tokio::spawn(serve_client(stream, proxy.clone(), clients.clone(), client));
        clients.lock().unwrap().clients.insert(client, handle);
    }
}

async fn serve_client(
    stream: TcpStream,
    proxy: AgentSessionProxy,
    clients: Arc<Mutex<ClientTable>>,
    client: u64,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut read_codec = FrameCodec::new();
    let write_codec = FrameCodec::new();

    let mut events = proxy.connection().events();
    let mut serial = 1u32;

    loop {
        tokio::select! {
            frame = read_codec.read_frame(&mut read_half) => match frame {
                Ok(Some(frame)) if frame.is_bye() => break,
                Ok(Some(frame)) => {
                    if let Some(reply) = handle_client_frame(&proxy, frame, &mut serial).await {
                        if write_codec.write_frame(&mut write_half, &reply).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(None) | Err(_) => break,
            },

            event = events.recv() => match event {
                Some(event) => {
                    let frame = match encode(&Message::event(event), &mut serial) {
                        Some(frame) => frame,
                        None => continue,
                    };
                    if write_codec.write_frame(&mut write_half, &frame).await.is_err() {
                        break;
                    }
                }
                // Agent connection gone; nothing left to relay
                None => break,
            }
        }
    }

    debug!("re-export client {} disconnected", client);

    let mut table = clients.lock().unwrap();
    table.registrations.remove(&client);
    table.clients.remove(&client);
}

async fn handle_client_frame(
    proxy: &AgentSessionProxy,
    frame: Frame,
    serial: &mut u32,
) -> Option<Frame> {
    let message = match rmp_serde::from_slice::<Message>(&frame.payload) {
        Ok(message) => message,
        Err(e) => {
            warn!("dropping undecodable client frame {}: {}", frame.serial, e);
            return None;
        }
    };

    match message {
        Message::Request(Request::Open { id, path }) => {
            let response = if path == object_path::AGENT_SESSION {
                Response::Opened { request_id: id }
            } else {
                Response::error(
                    id,
                    ErrorDetails::new(ErrorCode::NotFound, format!("no object at {}", path)),
                )
            };
            encode(&Message::response(response), serial)
        }
        Message::Request(request) => {
            let request_id = request.id();
            let response = match proxy.connection().request(request).await {
                Ok(response) => response,
                Err(e) => Response::error(
                    request_id,
                    ErrorDetails::new(ErrorCode::Failed, e.to_string()),
                ),
            };
            encode(&Message::response(response), serial)
        }
        other => {
            warn!("unexpected client message: {:?}", other);
            None
        }
    }
}

fn encode(message: &Message, serial: &mut u32) -> Option<Frame> {
    match rmp_serde::to_vec(message) {
        Ok(payload) => {
            let frame = Frame::data(*serial, Bytes::from(payload));
            *serial += 1;
            Some(frame)
        }
        Err(e) => {
            warn!("failed to serialize relay message: {}", e);
            None
        }
    }
}
