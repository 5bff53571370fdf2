//! Loader callback-socket handshake
//!
//! The injected loader, once its constructor runs inside the target,
//! connects back to a Unix socket at `<data_dir>/callback` and speaks a
//! tiny framed protocol: every value is `u8 length || bytes`. The loader
//! sends its pid as a decimal string, receives the host-agent pipe
//! address, and finally receives one more value as permission to let the
//! target resume.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::TransportError;

/// Name of the callback socket inside the loader data directory
pub const CALLBACK_SOCKET_NAME: &str = "callback";

/// Listener for the loader's callback connection
pub struct CallbackListener {
    /// Socket path, kept for cleanup
    path: PathBuf,
    /// Bound Unix listener
    listener: UnixListener,
}

impl CallbackListener {
    /// Bind the callback socket inside `data_dir`
    pub fn bind(data_dir: &Path) -> Result<Self, TransportError> {
        let path = data_dir.join(CALLBACK_SOCKET_NAME);
        let listener = UnixListener::bind(&path)
            .map_err(|e| TransportError::Handshake(format!("failed to bind {:?}: {}", path, e)))?;

        debug!("callback socket bound at {:?}", path);
        Ok(Self { path, listener })
    }

    /// Path of the bound socket
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept the loader connection and read its pid announcement
    pub async fn accept_loader(&self) -> Result<LoaderConnection, TransportError> {
        let (mut stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| TransportError::Handshake(format!("callback accept failed: {}", e)))?;

        let pid_value = recv_value(&mut stream).await?;
        let pid: u32 = pid_value
            .parse()
            .map_err(|_| TransportError::Handshake(format!("bad pid announcement: {:?}", pid_value)))?;

        debug!("loader connected from pid {}", pid);
        Ok(LoaderConnection { stream, pid })
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove callback socket {:?}: {}", self.path, e);
            }
        }
    }
}

/// An accepted loader connection, pid already announced
pub struct LoaderConnection {
    /// Callback stream to the loader
    stream: UnixStream,
    /// Pid the loader announced
    pid: u32,
}

impl LoaderConnection {
    /// Pid the loader announced when it connected
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Tell the loader where the host-agent pipe lives
    pub async fn send_pipe_address(&mut self, address: &str) -> Result<(), TransportError> {
        send_value(&mut self.stream, address).await
    }

    /// Send the final handshake value, releasing the loader constructor
    pub async fn permit_resume(mut self) -> Result<(), TransportError> {
        send_value(&mut self.stream, "ok").await
    }
}

/// Write one `u8 length || bytes` framed value
pub async fn send_value<W>(writer: &mut W, value: &str) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = value.as_bytes();
    if bytes.len() > u8::MAX as usize {
        return Err(TransportError::ValueTooLong { len: bytes.len() });
    }

    writer.write_all(&[bytes.len() as u8]).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one `u8 length || bytes` framed value
pub async fn recv_value<R>(reader: &mut R) -> Result<String, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 1];
    reader.read_exact(&mut len).await?;

    let mut buf = vec![0u8; len[0] as usize];
    reader.read_exact(&mut buf).await?;

    String::from_utf8(buf)
        .map_err(|_| TransportError::Handshake("non-UTF-8 handshake value".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_value_roundtrip() {
        let mut buf = Vec::new();
        send_value(&mut buf, "12345").await.unwrap();
        assert_eq!(buf[0], 5);

        let mut cursor = Cursor::new(buf);
        let value = recv_value(&mut cursor).await.unwrap();
        assert_eq!(value, "12345");
    }

    #[tokio::test]
    async fn test_value_too_long() {
        let mut buf = Vec::new();
        let long = "x".repeat(300);
        let result = send_value(&mut buf, &long).await;
        assert!(matches!(result, Err(TransportError::ValueTooLong { len: 300 })));
    }

    #[tokio::test]
    async fn test_loader_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let listener = CallbackListener::bind(dir.path()).unwrap();
        let socket_path = listener.path().to_path_buf();

        let loader = tokio::spawn(async move {
            let mut stream = UnixStream::connect(&socket_path).await.unwrap();
            send_value(&mut stream, "4242").await.unwrap();

            let pipe_address = recv_value(&mut stream).await.unwrap();
            assert_eq!(pipe_address, "unix:/tmp/pipe");

            // permission to resume
            recv_value(&mut stream).await.unwrap();
        });

        let mut conn = listener.accept_loader().await.unwrap();
        assert_eq!(conn.pid(), 4242);

        conn.send_pipe_address("unix:/tmp/pipe").await.unwrap();
        conn.permit_resume().await.unwrap();

        loader.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_pid_announcement() {
        let dir = tempfile::tempdir().unwrap();
        let listener = CallbackListener::bind(dir.path()).unwrap();
        let socket_path = listener.path().to_path_buf();

        tokio::spawn(async move {
            let mut stream = UnixStream::connect(&socket_path).await.unwrap();
            send_value(&mut stream, "not-a-pid").await.unwrap();
        });

        let result = listener.accept_loader().await;
        assert!(matches!(result, Err(TransportError::Handshake(_))));
    }

    #[test]
    fn test_socket_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();

        let listener = CallbackListener::bind(dir.path()).unwrap();
        let path = listener.path().to_path_buf();
        assert!(path.exists());

        drop(listener);
        assert!(!path.exists());
    }
}
