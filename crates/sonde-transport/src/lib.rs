//! # Sonde Transport
//!
//! Transport ownership capabilities, the loader callback handshake, and the
//! injector contract used by sonde host sessions to reach in-target agents.

#![warn(missing_docs)]

/// Transport ownership abstraction
pub mod transport;

/// Loader callback-socket handshake
#[cfg(unix)]
pub mod callback;

/// Injector contract and loader image preparation
pub mod injector;

/// Transport-specific error types
pub mod error;

#[cfg(unix)]
pub use callback::{CallbackListener, LoaderConnection};
pub use error::TransportError;
pub use injector::{patch_data_dir, verify_agent_image, Injector, LoaderSpec, DATA_DIR_MAGIC};
pub use transport::{BoxedStream, IoStream, NullTransport, Transport};
