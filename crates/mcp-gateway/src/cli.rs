//! CLI argument types for mcp-gateway.
//!
//! Defines the top-level [`Cli`] struct and one [`Args`] struct per bridge
//! using clap's derive macros. Each subcommand maps to a module in
//! [`crate::commands`].

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use mcp_gateway_core::logging::LogLevel;

use crate::child::ChildCommand;
use crate::config::{GatewayConfig, RouteConfig, add_header_line};
use crate::session::ReaperKind;

/// Bridge stdio MCP servers to SSE, WebSocket and Streamable HTTP, and
/// remote MCP servers back to stdio
#[derive(Parser, Debug)]
#[command(name = "mcp-gateway", version, about)]
pub struct Cli {
    /// Path to a TOML config file (default: `MCP_GATEWAY_CONFIG`)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log verbosity: trace, debug, info, warn, error or none
    #[arg(long, global = true, value_parser = parse_log_level)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve a stdio MCP server over SSE
    StdioToSse(StdioToSseArgs),
    /// Serve a stdio MCP server over WebSocket
    StdioToWs(StdioToWsArgs),
    /// Serve a stdio MCP server over Streamable HTTP
    StdioToStreamableHttp(StdioToStreamableArgs),
    /// Expose a remote SSE MCP server on stdio
    SseToStdio(RemoteArgs),
    /// Expose a remote Streamable HTTP MCP server on stdio
    StreamableHttpToStdio(RemoteArgs),
    /// Show resolved configuration
    Config(ConfigArgs),
}

fn parse_log_level(value: &str) -> Result<LogLevel, String> {
    LogLevel::parse(value).ok_or_else(|| format!("unknown log level `{value}`"))
}

/// The stdio server to run.
#[derive(Args, Debug, Clone)]
pub struct ChildArgs {
    /// Run this command line through the platform shell
    #[arg(long, conflicts_with = "command")]
    pub shell: Option<String>,

    /// Command and arguments, after `--`
    #[arg(last = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl ChildArgs {
    /// Returns `None` when neither `--shell` nor a command was given.
    pub fn command(&self) -> Option<ChildCommand> {
        match &self.shell {
            Some(line) => Some(ChildCommand::shell(line)),
            None => ChildCommand::from_argv(&self.command),
        }
    }
}

/// Flags shared by every server-side bridge.
#[derive(Args, Debug, Clone, Default)]
pub struct ServerArgs {
    /// Listen port
    #[arg(long)]
    pub port: Option<u16>,

    /// Health endpoint path (repeatable)
    #[arg(long = "health-endpoint", value_name = "PATH")]
    pub health_endpoints: Vec<String>,

    /// Response header as `Name: value` (repeatable)
    #[arg(long = "header", value_name = "HEADER")]
    pub headers: Vec<String>,

    /// Bearer token sent as `Authorization: Bearer <token>`
    #[arg(long)]
    pub oauth2_bearer: Option<String>,

    /// Enable CORS; no value allows any origin, `/regex/` entries match patterns
    #[arg(long, num_args = 0.., value_name = "ORIGIN")]
    pub cors: Option<Vec<String>>,

    /// Protocol version for gateway-originated `initialize`
    #[arg(long)]
    pub protocol_version: Option<String>,
}

impl ServerArgs {
    pub fn apply(&self, cfg: &mut GatewayConfig) {
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if !self.health_endpoints.is_empty() {
            cfg.health_endpoints = self.health_endpoints.clone();
        }
        for line in &self.headers {
            add_header_line(&mut cfg.headers, line);
        }
        if let Some(token) = &self.oauth2_bearer {
            cfg.oauth2_bearer = Some(token.clone());
        }
        if let Some(origins) = &self.cors {
            cfg.cors = Some(origins.clone());
        }
        if let Some(version) = &self.protocol_version {
            cfg.protocol_version = version.clone();
        }
    }
}

/// Arguments for `stdio-to-sse`
#[derive(Args, Debug)]
pub struct StdioToSseArgs {
    #[command(flatten)]
    pub server: ServerArgs,

    /// Public base URL for the advertised message endpoint
    #[arg(long)]
    pub base_url: Option<String>,

    #[arg(long)]
    pub sse_path: Option<String>,

    #[arg(long)]
    pub message_path: Option<String>,

    /// Extra route as `PREFIX=COMMAND` (repeatable)
    #[arg(long = "route", value_name = "PREFIX=COMMAND")]
    pub routes: Vec<RouteConfig>,

    #[command(flatten)]
    pub child: ChildArgs,
}

impl StdioToSseArgs {
    pub fn apply(&self, cfg: &mut GatewayConfig) {
        self.server.apply(cfg);
        if let Some(url) = &self.base_url {
            cfg.base_url = url.clone();
        }
        if let Some(path) = &self.sse_path {
            cfg.sse_path = path.clone();
        }
        if let Some(path) = &self.message_path {
            cfg.message_path = path.clone();
        }
        cfg.routes.extend(self.routes.iter().cloned());
    }
}

/// Arguments for `stdio-to-ws`
#[derive(Args, Debug)]
pub struct StdioToWsArgs {
    #[command(flatten)]
    pub server: ServerArgs,

    /// WebSocket upgrade path
    #[arg(long)]
    pub message_path: Option<String>,

    #[command(flatten)]
    pub child: ChildArgs,
}

impl StdioToWsArgs {
    pub fn apply(&self, cfg: &mut GatewayConfig) {
        self.server.apply(cfg);
        if let Some(path) = &self.message_path {
            cfg.message_path = path.clone();
        }
    }
}

/// Arguments for `stdio-to-streamable-http`
#[derive(Args, Debug)]
pub struct StdioToStreamableArgs {
    #[command(flatten)]
    pub server: ServerArgs,

    #[arg(long)]
    pub streamable_http_path: Option<String>,

    /// Keep one child per session instead of one per request
    #[arg(long)]
    pub stateful: bool,

    /// Idle timeout in milliseconds for stateful sessions
    #[arg(long, value_name = "MS", requires = "stateful")]
    pub session_timeout: Option<u64>,

    /// Idle policy: access-count or activity
    #[arg(long, requires = "stateful")]
    pub session_reaper: Option<ReaperKind>,

    #[command(flatten)]
    pub child: ChildArgs,
}

impl StdioToStreamableArgs {
    pub fn apply(&self, cfg: &mut GatewayConfig) {
        self.server.apply(cfg);
        if let Some(path) = &self.streamable_http_path {
            cfg.streamable_http_path = path.clone();
        }
        if let Some(ms) = self.session_timeout {
            cfg.session_timeout_ms = Some(ms);
        }
        if let Some(kind) = self.session_reaper {
            cfg.session_reaper = kind;
        }
    }
}

/// Arguments for `sse-to-stdio` and `streamable-http-to-stdio`
#[derive(Args, Debug)]
pub struct RemoteArgs {
    /// Remote endpoint URL
    pub url: String,

    /// Request header as `Name: value` (repeatable)
    #[arg(long = "header", value_name = "HEADER")]
    pub headers: Vec<String>,

    /// Bearer token sent as `Authorization: Bearer <token>`
    #[arg(long)]
    pub oauth2_bearer: Option<String>,

    /// Protocol version for gateway-originated `initialize`
    #[arg(long)]
    pub protocol_version: Option<String>,
}

impl RemoteArgs {
    pub fn apply(&self, cfg: &mut GatewayConfig) {
        for line in &self.headers {
            add_header_line(&mut cfg.headers, line);
        }
        if let Some(token) = &self.oauth2_bearer {
            cfg.oauth2_bearer = Some(token.clone());
        }
        if let Some(version) = &self.protocol_version {
            cfg.protocol_version = version.clone();
        }
    }
}

/// Arguments for the `config` subcommand
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_child_command_after_double_dash() {
        let cli = parse(&["mcp-gateway", "stdio-to-sse", "--port", "9000", "--", "npx", "-y", "server", "--flag"]);
        let Commands::StdioToSse(args) = cli.command else {
            panic!("expected stdio-to-sse");
        };
        assert_eq!(args.server.port, Some(9000));
        let command = args.child.command().unwrap();
        assert_eq!(command.program, "npx");
        assert_eq!(command.args, vec!["-y", "server", "--flag"]);
    }

    #[test]
    fn test_shell_command() {
        let cli = parse(&["mcp-gateway", "stdio-to-ws", "--shell", "my-server --verbose"]);
        let Commands::StdioToWs(args) = cli.command else {
            panic!("expected stdio-to-ws");
        };
        let command = args.child.command().unwrap();
        assert_eq!(command.args.last().map(String::as_str), Some("my-server --verbose"));
    }

    #[test]
    fn test_shell_conflicts_with_argv() {
        assert!(Cli::try_parse_from(["mcp-gateway", "stdio-to-sse", "--shell", "a", "--", "b"]).is_err());
    }

    #[test]
    fn test_missing_child_command() {
        let cli = parse(&["mcp-gateway", "stdio-to-sse"]);
        let Commands::StdioToSse(args) = cli.command else {
            panic!("expected stdio-to-sse");
        };
        assert!(args.child.command().is_none());
    }

    #[test]
    fn test_cors_without_values_allows_any() {
        let cli = parse(&["mcp-gateway", "stdio-to-ws", "--cors", "--", "srv"]);
        let Commands::StdioToWs(args) = cli.command else {
            panic!("expected stdio-to-ws");
        };
        assert_eq!(args.server.cors, Some(Vec::new()));

        let cli = parse(&["mcp-gateway", "stdio-to-ws", "--cors", "https://a.dev", "/b/", "--", "srv"]);
        let Commands::StdioToWs(args) = cli.command else {
            panic!("expected stdio-to-ws");
        };
        assert_eq!(args.server.cors, Some(vec!["https://a.dev".to_string(), "/b/".to_string()]));
    }

    #[test]
    fn test_streamable_flags_apply_over_config() {
        let cli = parse(&[
            "mcp-gateway",
            "--log-level",
            "debug",
            "stdio-to-streamable-http",
            "--stateful",
            "--session-timeout",
            "5000",
            "--session-reaper",
            "activity",
            "--header",
            "X-Env: prod",
            "--",
            "srv",
        ]);
        assert_eq!(cli.log_level, Some(LogLevel::Debug));
        let Commands::StdioToStreamableHttp(args) = cli.command else {
            panic!("expected stdio-to-streamable-http");
        };
        assert!(args.stateful);
        let mut cfg = GatewayConfig::default();
        args.apply(&mut cfg);
        assert_eq!(cfg.session_timeout_ms, Some(5000));
        assert_eq!(cfg.session_reaper, ReaperKind::Activity);
        assert_eq!(cfg.headers["X-Env"], "prod");
    }

    #[test]
    fn test_session_timeout_requires_stateful() {
        assert!(
            Cli::try_parse_from([
                "mcp-gateway",
                "stdio-to-streamable-http",
                "--session-timeout",
                "10",
                "--",
                "srv"
            ])
            .is_err()
        );
    }

    #[test]
    fn test_routes_and_remote_args() {
        let cli = parse(&["mcp-gateway", "stdio-to-sse", "--route", "/gh=github-mcp", "--", "srv"]);
        let Commands::StdioToSse(args) = cli.command else {
            panic!("expected stdio-to-sse");
        };
        let mut cfg = GatewayConfig::default();
        args.apply(&mut cfg);
        assert_eq!(cfg.routes.len(), 1);
        assert_eq!(cfg.routes[0].command, "github-mcp");

        let cli = parse(&[
            "mcp-gateway",
            "sse-to-stdio",
            "http://localhost:8000/sse",
            "--oauth2-bearer",
            "tok",
        ]);
        let Commands::SseToStdio(args) = cli.command else {
            panic!("expected sse-to-stdio");
        };
        assert_eq!(args.url, "http://localhost:8000/sse");
        let mut cfg = GatewayConfig::default();
        args.apply(&mut cfg);
        assert_eq!(cfg.oauth2_bearer.as_deref(), Some("tok"));
    }
}
