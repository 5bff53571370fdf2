//! Built-in backends, one per transport family

/// Local system backend
#[cfg(unix)]
pub mod local;

/// TCP remote-endpoint backend
pub mod tcp;

/// USB-tethered device backend
pub mod tether;

#[cfg(unix)]
pub use local::{LocalBackendConfig, LocalProvider, LocalSession, LocalSystemBackend};
pub use tcp::{TcpBackend, TcpProvider, TcpSession};
pub use tether::{TetherBackend, TetherDevice, TetherProvider};
