//! `sse-to-stdio` and `streamable-http-to-stdio`: present a remote MCP
//! endpoint on this process's stdin/stdout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;

use crate::bridge::client;
use crate::cli::RemoteArgs;
use crate::config::{GatewayConfig, resolve_config};
use crate::http::shutdown_signal;
use crate::remote::{RemoteEndpoint, SseRemote, StreamableRemote, header_map};

fn resolve(config_path: &Option<PathBuf>, args: &RemoteArgs) -> anyhow::Result<GatewayConfig> {
    let mut cfg = resolve_config(config_path.as_deref())?;
    args.apply(&mut cfg);
    Ok(cfg)
}

/// Run the SSE client bridge.
///
/// # Errors
///
/// Fails when the remote cannot be reached or its stream ends.
pub async fn run_sse(config_path: &Option<PathBuf>, args: RemoteArgs) -> anyhow::Result<()> {
    let cfg = resolve(config_path, &args)?;
    let (tx, rx) = mpsc::unbounded_channel();
    let remote = SseRemote::connect(&args.url, header_map(&cfg.header_pairs()), tx)
        .await
        .with_context(|| format!("failed to connect to {}", args.url))?;
    bridge(Arc::new(remote), rx, &cfg.protocol_version).await
}

/// Run the Streamable HTTP client bridge.
///
/// # Errors
///
/// Fails on an invalid URL or local I/O failure.
pub async fn run_streamable(config_path: &Option<PathBuf>, args: RemoteArgs) -> anyhow::Result<()> {
    let cfg = resolve(config_path, &args)?;
    let (tx, rx) = mpsc::unbounded_channel();
    let remote = StreamableRemote::new(&args.url, header_map(&cfg.header_pairs()), tx)?;
    bridge(Arc::new(remote), rx, &cfg.protocol_version).await
}

async fn bridge(
    remote: Arc<dyn RemoteEndpoint>,
    inbound: mpsc::UnboundedReceiver<mcp_gateway_core::Envelope>,
    protocol_version: &str,
) -> anyhow::Result<()> {
    tokio::select! {
        result = client::run(
            Arc::clone(&remote),
            inbound,
            tokio::io::stdin(),
            tokio::io::stdout(),
            protocol_version,
        ) => result.context("remote bridge stopped"),
        () = shutdown_signal() => {
            remote.shutdown().await;
            Ok(())
        }
    }
}
