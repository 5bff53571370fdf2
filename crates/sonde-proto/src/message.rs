//! Message types and enums

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level message wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Request message (host to agent)
    Request(Request),
    /// Response message (agent to host, correlated)
    Response(Response),
    /// Asynchronous event (agent to host, uncorrelated)
    Event(Event),
}

impl Message {
    /// Create a request message
    pub fn request(req: Request) -> Self {
        Self::Request(req)
    }

    /// Create a response message
    pub fn response(resp: Response) -> Self {
        Self::Response(resp)
    }

    /// Create an event message
    pub fn event(event: Event) -> Self {
        Self::Event(event)
    }
}

/// Request message types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Resolve the typed session interface at a well-known object path.
    /// Sent once per connection before anything else.
    Open {
        /// Request ID for correlation
        id: Uuid,
        /// Object path to resolve
        path: String,
    },

    /// Compile a new script inside the target
    CreateScript {
        /// Request ID for correlation
        id: Uuid,
        /// Script name; the agent picks a default when absent
        name: Option<String>,
        /// Script source text
        source: String,
    },

    /// Destroy a script and wait for its instrumentation to quiesce
    DestroyScript {
        /// Request ID for correlation
        id: Uuid,
        /// Script to destroy
        script: u32,
    },

    /// Load a previously created script
    LoadScript {
        /// Request ID for correlation
        id: Uuid,
        /// Script to load
        script: u32,
    },

    /// Deliver a message to a script
    PostScriptMessage {
        /// Request ID for correlation
        id: Uuid,
        /// Destination script
        script: u32,
        /// Message body
        message: String,
    },

    /// Install the process-wide debug-message hook
    EnableDebugger {
        /// Request ID for correlation
        id: Uuid,
    },

    /// Remove the process-wide debug-message hook
    DisableDebugger {
        /// Request ID for correlation
        id: Uuid,
    },

    /// Deliver a message to the script debugger
    PostDebugMessage {
        /// Request ID for correlation
        id: Uuid,
        /// Message body
        message: String,
    },

    /// Liveness probe
    Ping {
        /// Request ID for correlation
        id: Uuid,
    },
}

impl Request {
    /// Get the request ID
    pub fn id(&self) -> Uuid {
        match self {
            Self::Open { id, .. } => *id,
            Self::CreateScript { id, .. } => *id,
            Self::DestroyScript { id, .. } => *id,
            Self::LoadScript { id, .. } => *id,
            Self::PostScriptMessage { id, .. } => *id,
            Self::EnableDebugger { id } => *id,
            Self::DisableDebugger { id } => *id,
            Self::PostDebugMessage { id, .. } => *id,
            Self::Ping { id } => *id,
        }
    }

    /// Create an open request
    pub fn open(path: impl Into<String>) -> Self {
        Self::Open {
            id: Uuid::new_v4(),
            path: path.into(),
        }
    }

    /// Create a create-script request
    pub fn create_script(name: Option<String>, source: impl Into<String>) -> Self {
        Self::CreateScript {
            id: Uuid::new_v4(),
            name,
            source: source.into(),
        }
    }

    /// Create a destroy-script request
    pub fn destroy_script(script: u32) -> Self {
        Self::DestroyScript {
            id: Uuid::new_v4(),
            script,
        }
    }

    /// Create a load-script request
    pub fn load_script(script: u32) -> Self {
        Self::LoadScript {
            id: Uuid::new_v4(),
            script,
        }
    }

    /// Create a post-script-message request
    pub fn post_script_message(script: u32, message: impl Into<String>) -> Self {
        Self::PostScriptMessage {
            id: Uuid::new_v4(),
            script,
            message: message.into(),
        }
    }

    /// Create an enable-debugger request
    pub fn enable_debugger() -> Self {
        Self::EnableDebugger { id: Uuid::new_v4() }
    }

    /// Create a disable-debugger request
    pub fn disable_debugger() -> Self {
        Self::DisableDebugger { id: Uuid::new_v4() }
    }

    /// Create a post-debug-message request
    pub fn post_debug_message(message: impl Into<String>) -> Self {
        Self::PostDebugMessage {
            id: Uuid::new_v4(),
            message: message.into(),
        }
    }

    /// Create a ping request
    pub fn ping() -> Self {
        Self::Ping { id: Uuid::new_v4() }
    }
}

/// Response message types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Object path resolved; the session interface is live
    Opened {
        /// ID of the request this responds to
        request_id: Uuid,
    },

    /// Operation completed with no payload
    Done {
        /// ID of the request this responds to
        request_id: Uuid,
    },

    /// Script created
    ScriptCreated {
        /// ID of the request this responds to
        request_id: Uuid,
        /// Identifier of the new script
        script: u32,
    },

    /// Ping reply
    Pong {
        /// ID of the request this responds to
        request_id: Uuid,
    },

    /// Operation failed
    Error {
        /// ID of the request this responds to
        request_id: Uuid,
        /// Failure details
        error: ErrorDetails,
    },
}

impl Response {
    /// Get the ID of the request this response correlates with
    pub fn request_id(&self) -> Uuid {
        match self {
            Self::Opened { request_id } => *request_id,
            Self::Done { request_id } => *request_id,
            Self::ScriptCreated { request_id, .. } => *request_id,
            Self::Pong { request_id } => *request_id,
            Self::Error { request_id, .. } => *request_id,
        }
    }

    /// Create an error response
    pub fn error(request_id: Uuid, error: ErrorDetails) -> Self {
        Self::Error { request_id, error }
    }

    /// Create a unit-ack response
    pub fn done(request_id: Uuid) -> Self {
        Self::Done { request_id }
    }
}

/// Asynchronous events flowing agent to host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// A script emitted a message
    ScriptMessage {
        /// Originating script
        script: u32,
        /// Message body
        message: String,
        /// Optional binary payload
        data: Option<Bytes>,
    },

    /// The script debugger emitted a message
    DebugMessage {
        /// Message body
        message: String,
    },
}

/// Error information carried in error responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Machine-readable error class
    pub code: ErrorCode,
    /// Human-readable description
    pub message: String,
}

impl ErrorDetails {
    /// Create new error details
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Machine-readable error classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The referenced object does not exist
    NotFound,
    /// The operation failed; details in the message
    Failed,
    /// The peer does not implement the operation
    Unsupported,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique() {
        let a = Request::ping();
        let b = Request::ping();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_response_correlation() {
        let request = Request::create_script(None, "probe()");
        let response = Response::ScriptCreated {
            request_id: request.id(),
            script: 1,
        };
        assert_eq!(response.request_id(), request.id());
    }

    #[test]
    fn test_message_roundtrip() {
        let request = Request::post_script_message(4, "ping");
        let message = Message::request(request.clone());

        let bytes = rmp_serde::to_vec(&message).unwrap();
        let decoded: Message = rmp_serde::from_slice(&bytes).unwrap();

        match decoded {
            Message::Request(Request::PostScriptMessage {
                id,
                script,
                message,
            }) => {
                assert_eq!(id, request.id());
                assert_eq!(script, 4);
                assert_eq!(message, "ping");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_event_roundtrip() {
        let event = Event::ScriptMessage {
            script: 2,
            message: "hit".to_string(),
            data: Some(Bytes::from(vec![1, 2, 3])),
        };

        let bytes = rmp_serde::to_vec(&Message::event(event)).unwrap();
        let decoded: Message = rmp_serde::from_slice(&bytes).unwrap();

        match decoded {
            Message::Event(Event::ScriptMessage {
                script,
                message,
                data,
            }) => {
                assert_eq!(script, 2);
                assert_eq!(message, "hit");
                assert_eq!(data, Some(Bytes::from(vec![1, 2, 3])));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_error_details() {
        let details = ErrorDetails::new(ErrorCode::NotFound, "invalid script id");
        assert_eq!(details.code, ErrorCode::NotFound);
        assert_eq!(details.message, "invalid script id");
    }
}
