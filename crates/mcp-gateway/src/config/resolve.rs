//! Config resolution for mcp-gateway.
//!
//! Resolves [`GatewayConfig`] from the following sources, highest priority
//! first:
//!
//! 1. CLI flags (applied by the caller after [`resolve_config`] returns)
//! 2. Environment variables (`MCP_GATEWAY_*`, `MCP_STDIO_PROCESS_*`)
//! 3. The TOML file named by `--config` or `MCP_GATEWAY_CONFIG`
//! 4. Compiled-in defaults (via [`GatewayConfig::default`])

use std::path::{Path, PathBuf};

use anyhow::Context;

use super::types::GatewayConfig;

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV: &str = "MCP_GATEWAY_CONFIG";

/// Resolve the gateway configuration.
///
/// # Errors
///
/// Returns an error if the config file cannot be read or is not valid TOML
/// for [`GatewayConfig`]. A missing file is an error only when it was named
/// explicitly.
pub fn resolve_config(config_path: Option<&Path>) -> anyhow::Result<GatewayConfig> {
    let path = config_path.map(Path::to_path_buf).or_else(|| {
        std::env::var(CONFIG_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    });

    let mut cfg = match path {
        Some(path) => load_file(&path)?,
        None => GatewayConfig::default(),
    };
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

fn load_file(path: &Path) -> anyhow::Result<GatewayConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let cfg = toml::from_str(&text)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config file");
    Ok(cfg)
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_value(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

/// Apply environment overrides to `cfg`. Empty or unparsable values are
/// treated as "not set".
fn apply_env_overrides(cfg: &mut GatewayConfig) {
    if let Some(n) = env_parsed("MCP_STDIO_PROCESS_PRE_FORK") {
        cfg.pool.prefork = n;
    }
    if let Some(n) = env_parsed("MCP_STDIO_PROCESS_MAX") {
        cfg.pool.max = n;
    }
    if let Some(port) = env_parsed("MCP_GATEWAY_PORT") {
        cfg.port = port;
    }
    if let Some(url) = env_value("MCP_GATEWAY_BASE_URL") {
        cfg.base_url = url;
    }
    if let Some(ms) = env_parsed("MCP_GATEWAY_SESSION_TIMEOUT_MS") {
        cfg.session_timeout_ms = Some(ms);
    }
    if let Some(version) = env_value("MCP_GATEWAY_PROTOCOL_VERSION") {
        cfg.protocol_version = version;
    }
}
