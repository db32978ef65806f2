//! `stdio-to-sse`: serve stdio commands over SSE.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use super::{SHUTDOWN_GRACE, spawner};
use crate::bridge::sse::{self, SseOptions, SseRoute};
use crate::child::{ChildCommand, CommandSpawner};
use crate::cli::StdioToSseArgs;
use crate::config::resolve_config;
use crate::http::{self, Server};
use crate::pool::ChildPool;

/// Run the SSE bridge until Ctrl+C or SIGTERM.
///
/// # Errors
///
/// Fails on bad configuration, a missing command, or a port that cannot be
/// bound.
pub async fn run(config_path: &Option<PathBuf>, args: StdioToSseArgs) -> anyhow::Result<()> {
    let mut cfg = resolve_config(config_path.as_deref())?;
    args.apply(&mut cfg);
    let pool_options = cfg.pool.options();

    let mut routes = Vec::with_capacity(cfg.routes.len() + 1);
    if args.child.command().is_some() || cfg.routes.is_empty() {
        routes.push(SseRoute {
            prefix: String::new(),
            pool: ChildPool::new(spawner(&args.child)?, pool_options.clone()),
        });
    }
    for route in &cfg.routes {
        tracing::info!(prefix = %route.prefix, command = %route.command, "mounting route");
        let spawner = Arc::new(CommandSpawner::new(ChildCommand::shell(&route.command)));
        routes.push(SseRoute {
            prefix: route.prefix.clone(),
            pool: ChildPool::new(spawner, pool_options.clone()),
        });
    }
    let pools: Vec<ChildPool> = routes.iter().map(|r| r.pool.clone()).collect();

    let options = SseOptions {
        base_url: cfg.base_url.clone(),
        sse_path: cfg.sse_path.clone(),
        message_path: cfg.message_path.clone(),
        reset_on_release: cfg.reset_on_release,
    };
    let router = http::finish(sse::router(routes, &options), &cfg.http_options()?, None);
    let server = Server::bind(cfg.port, router)
        .await
        .context("failed to start SSE bridge")?;
    tracing::info!(
        sse = %cfg.sse_path,
        message = %cfg.message_path,
        port = server.local_addr().port(),
        "SSE bridge ready"
    );

    http::shutdown_signal().await;
    let stopped = server.stop(SHUTDOWN_GRACE).await;
    for pool in pools {
        pool.shutdown();
    }
    stopped.context("SSE listener failed")
}
