//! Injector contract and loader image preparation
//!
//! The native injector is an external collaborator: given a pid and a
//! prepared loader image it maps the loader into the target, whose
//! constructor then dials the callback socket (see [`crate::callback`]).
//! This module carries the contract plus the two pieces of image
//! preparation the host owns: patching the data directory into the loader
//! and verifying the agent image digest before it is handed out.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::TransportError;

/// Magic string compiled into the loader image, overwritten in place with
/// the data directory path at injection time. The magic marks the head of
/// a 256-byte buffer, so a patched path may use up to 255 bytes plus the
/// terminating NUL.
pub const DATA_DIR_MAGIC: &str = "sQ3vR1xm9dYhK2fTeW8pZbC5uN0aLJ7g";

/// Size of the loader's data directory buffer
const DATA_DIR_CAPACITY: usize = 256;

/// Everything the injector needs to bring a loader up inside a target
#[derive(Debug, Clone)]
pub struct LoaderSpec {
    /// Scratch directory holding the callback socket and agent image
    pub data_dir: PathBuf,
    /// Agent image the loader will map once it has the pipe address
    pub agent_image: PathBuf,
}

/// External injector collaborator
#[async_trait]
pub trait Injector: Send + Sync {
    /// Map the loader into `pid` and run its constructor
    async fn inject(&self, pid: u32, spec: &LoaderSpec) -> Result<(), TransportError>;
}

/// Patch the loader image's data directory buffer in place
///
/// Locates [`DATA_DIR_MAGIC`] and overwrites it with `data_dir` as a
/// NUL-terminated string.
pub fn patch_data_dir(image: &mut [u8], data_dir: &Path) -> Result<(), TransportError> {
    let path_bytes = data_dir.as_os_str().as_encoded_bytes();
    if path_bytes.len() >= DATA_DIR_CAPACITY {
        return Err(TransportError::Injection(format!(
            "data directory path too long: {} bytes (max: {})",
            path_bytes.len(),
            DATA_DIR_CAPACITY - 1
        )));
    }

    let magic = DATA_DIR_MAGIC.as_bytes();
    let offset = image
        .windows(magic.len())
        .position(|window| window == magic)
        .ok_or_else(|| TransportError::Injection("loader image has no data-dir magic".to_string()))?;

    if offset + DATA_DIR_CAPACITY > image.len() {
        return Err(TransportError::Injection(
            "loader image truncated at data-dir buffer".to_string(),
        ));
    }

    let buffer = &mut image[offset..offset + DATA_DIR_CAPACITY];
    buffer[..path_bytes.len()].copy_from_slice(path_bytes);
    buffer[path_bytes.len()..].fill(0);

    debug!("patched loader data dir at offset {}", offset);
    Ok(())
}

/// Verify an agent image against a pinned SHA-256 digest (lowercase hex)
pub fn verify_agent_image(image: &[u8], expected: &str) -> Result<(), TransportError> {
    let mut hasher = Sha256::new();
    hasher.update(image);
    let actual = hex_encode(&hasher.finalize());

    if actual != expected.to_ascii_lowercase() {
        return Err(TransportError::Integrity {
            expected: expected.to_string(),
            actual,
        });
    }

    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}
