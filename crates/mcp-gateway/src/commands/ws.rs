//! `stdio-to-ws`: share one stdio command between WebSocket clients.

use std::path::PathBuf;

use anyhow::Context;

use super::{SHUTDOWN_GRACE, spawner};
use crate::bridge::ws::{self, WsHub};
use crate::child::{ChildHandle, ChildSpawner};
use crate::cli::StdioToWsArgs;
use crate::config::resolve_config;
use crate::http::{self, Server};

/// Run the WebSocket bridge until a shutdown signal or the child exits.
///
/// # Errors
///
/// Fails on bad configuration or a port that cannot be bound, and when the
/// shared child exits (the error carries its exit status).
pub async fn run(config_path: &Option<PathBuf>, args: StdioToWsArgs) -> anyhow::Result<()> {
    let mut cfg = resolve_config(config_path.as_deref())?;
    args.apply(&mut cfg);

    let io = spawner(&args.child)?.spawn()?;
    let hub = WsHub::new(ChildHandle::start(1, io));
    hub.start_grace(cfg.ws_connect_grace());

    let router = http::finish(
        ws::router(hub.clone(), &cfg.message_path),
        &cfg.http_options()?,
        Some(hub.health_check()),
    );
    let server = Server::bind(cfg.port, router)
        .await
        .context("failed to start WebSocket bridge")?;
    tracing::info!(path = %cfg.message_path, port = server.local_addr().port(), "WebSocket bridge ready");

    let outcome = tokio::select! {
        () = http::shutdown_signal() => Ok(()),
        info = hub.clone().run() => Err(anyhow::anyhow!("child process exited ({info})")),
    };
    hub.shutdown();
    server.stop(SHUTDOWN_GRACE).await.context("WebSocket listener failed")?;
    outcome
}
