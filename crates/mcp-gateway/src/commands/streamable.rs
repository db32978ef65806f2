//! `stdio-to-streamable-http`: serve a stdio command over Streamable HTTP.

use std::path::PathBuf;

use anyhow::Context;

use super::{SHUTDOWN_GRACE, spawner};
use crate::bridge::streamable::{StatefulBridge, StatefulOptions, StatelessBridge};
use crate::cli::StdioToStreamableArgs;
use crate::config::resolve_config;
use crate::http::{self, Server};

/// Run the Streamable HTTP bridge until Ctrl+C or SIGTERM.
///
/// # Errors
///
/// Fails on bad configuration, a missing command, or a port that cannot be
/// bound.
pub async fn run(config_path: &Option<PathBuf>, args: StdioToStreamableArgs) -> anyhow::Result<()> {
    let mut cfg = resolve_config(config_path.as_deref())?;
    args.apply(&mut cfg);
    let spawner = spawner(&args.child)?;
    let path = cfg.streamable_http_path.as_str();

    let (router, stateful) = if args.stateful {
        let options = StatefulOptions {
            session_timeout: cfg.session_timeout(),
            reaper: cfg.session_reaper,
        };
        let bridge = StatefulBridge::new(spawner, &options);
        (bridge.router(path), Some(bridge))
    } else {
        (StatelessBridge::new(spawner, cfg.protocol_version.clone()).router(path), None)
    };

    let router = http::finish(router, &cfg.http_options()?, None);
    let server = Server::bind(cfg.port, router)
        .await
        .context("failed to start Streamable HTTP bridge")?;
    tracing::info!(
        %path,
        stateful = args.stateful,
        port = server.local_addr().port(),
        "Streamable HTTP bridge ready"
    );

    http::shutdown_signal().await;
    let stopped = server.stop(SHUTDOWN_GRACE).await;
    if let Some(bridge) = stateful {
        bridge.shutdown();
    }
    stopped.context("Streamable HTTP listener failed")
}
