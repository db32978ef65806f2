//! Shared logging initialization for mcp-gateway binaries.
//!
//! Output always goes to stderr. In the client bridges stdout carries the
//! protocol, so nothing else may ever be written there.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

static INIT: OnceLock<()> = OnceLock::new();

/// Environment variable consulted when no level is given on the command line.
pub const LOG_ENV: &str = "MCP_GATEWAY_LOG";

/// Requested verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Install no subscriber at all.
    None,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Parse a level name, case-insensitively. Unknown names yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Some(Self::None),
            "error" => Some(Self::Error),
            "warn" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }

    fn directive(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Error => Some("error"),
            Self::Warn => Some("warn"),
            Self::Info => Some("info"),
            Self::Debug => Some("debug"),
            Self::Trace => Some("trace"),
        }
    }
}

/// Resolve the filter directive: an explicit level wins, then `MCP_GATEWAY_LOG`
/// (either a level name or a full `EnvFilter` directive), then `info`.
fn resolve_filter(explicit: Option<LogLevel>) -> Option<EnvFilter> {
    if let Some(level) = explicit {
        return level.directive().map(EnvFilter::new);
    }
    match std::env::var(LOG_ENV) {
        Ok(raw) if !raw.trim().is_empty() => match LogLevel::parse(&raw) {
            Some(level) => level.directive().map(EnvFilter::new),
            None => Some(EnvFilter::try_new(raw.trim()).unwrap_or_else(|_| EnvFilter::new("info"))),
        },
        _ => Some(EnvFilter::new("info")),
    }
}

/// Initialize process-level tracing output.
///
/// Safe to call multiple times; only the first call has any effect. Never
/// fails: a subscriber that cannot be installed is silently skipped.
pub fn init(level: Option<LogLevel>) {
    if INIT.get().is_some() {
        return;
    }
    if let Some(filter) = resolve_filter(level) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    }
    let _ = INIT.set(());
}
