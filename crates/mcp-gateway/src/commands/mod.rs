//! Command implementations for mcp-gateway subcommands.
//!
//! Each module corresponds to one or more top-level subcommands exposed by
//! the CLI.

pub mod client;
pub mod config_cmd;
pub mod sse;
pub mod streamable;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::child::{ChildSpawner, CommandSpawner};
use crate::cli::ChildArgs;

/// How long open connections get to finish once shutdown starts.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Spawner for the command given after `--` or with `--shell`.
fn spawner(child: &ChildArgs) -> anyhow::Result<Arc<dyn ChildSpawner>> {
    let command = child
        .command()
        .context("no child command given; pass it after `--` or with --shell")?;
    tracing::info!(%command, "serving stdio command");
    Ok(Arc::new(CommandSpawner::new(command)))
}
