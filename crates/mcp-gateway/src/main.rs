//! mcp-gateway: bridge MCP servers between stdio and HTTP transports.
//!
//! # Subcommands
//!
//! - `stdio-to-sse`: serve a stdio server over SSE
//! - `stdio-to-ws`: serve a stdio server over WebSocket
//! - `stdio-to-streamable-http`: serve a stdio server over Streamable HTTP
//! - `sse-to-stdio`: expose a remote SSE server on stdio
//! - `streamable-http-to-stdio`: expose a remote Streamable HTTP server on stdio
//! - `config`: show resolved configuration

use clap::Parser;
use mcp_gateway_core::logging;

use mcp_gateway::cli::{Cli, Commands};
use mcp_gateway::commands;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level);

    match cli.command {
        Commands::StdioToSse(args) => commands::sse::run(&cli.config, args).await,
        Commands::StdioToWs(args) => commands::ws::run(&cli.config, args).await,
        Commands::StdioToStreamableHttp(args) => commands::streamable::run(&cli.config, args).await,
        Commands::SseToStdio(args) => commands::client::run_sse(&cli.config, args).await,
        Commands::StreamableHttpToStdio(args) => commands::client::run_streamable(&cli.config, args).await,
        Commands::Config(args) => commands::config_cmd::run(&cli.config, args).await,
    }
}
