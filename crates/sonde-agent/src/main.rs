//! Sonde agent binary
//!
//! Out-of-process form of the agent: connects to the pipe address the
//! loader was handed and services the host session over it.

#[cfg(unix)]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use std::sync::Arc;

    use anyhow::Context;
    use sonde_agent::{AgentLoop, LoopbackRuntime, ScriptEngine};
    use tracing::info;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let address = std::env::args()
        .nth(1)
        .context("usage: sonde-agent <pipe-address>")?;
    let path = address.strip_prefix("unix:").unwrap_or(&address).to_string();

    info!("sonde agent connecting to {}", path);
    let stream = tokio::net::UnixStream::connect(&path)
        .await
        .with_context(|| format!("failed to connect to {}", path))?;

    let engine = Arc::new(ScriptEngine::new(
        Arc::new(LoopbackRuntime::new()),
        own_image_range(),
    ));
    AgentLoop::new(stream, engine).run().await
}

/// Locate this image in memory so scripts can be told to leave it alone
#[cfg(unix)]
fn own_image_range() -> sonde_agent::MemoryRange {
    #[cfg(target_os = "linux")]
    {
        if let Ok(maps) = std::fs::read_to_string("/proc/self/maps") {
            if let Some(range) = first_exe_mapping(&maps) {
                return range;
            }
        }
    }
    sonde_agent::MemoryRange::default()
}

#[cfg(target_os = "linux")]
fn first_exe_mapping(maps: &str) -> Option<sonde_agent::MemoryRange> {
    let exe = std::fs::read_link("/proc/self/exe").ok()?;
    let exe = exe.to_string_lossy();

    for line in maps.lines() {
        if !line.ends_with(exe.as_ref()) {
            continue;
        }
        let addresses = line.split_whitespace().next()?;
        let (start, end) = addresses.split_once('-')?;
        let base = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        return Some(sonde_agent::MemoryRange::new(base, end.checked_sub(base)?));
    }
    None
}

#[cfg(not(unix))]
fn main() {
    eprintln!("the sonde agent requires a Unix host");
    std::process::exit(1);
}
