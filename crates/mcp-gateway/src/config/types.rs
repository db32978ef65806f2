//! Configuration types for mcp-gateway.
//!
//! [`GatewayConfig`] is deserialized from an optional TOML file. Every field
//! has a default, so an empty or absent file yields a working gateway.
//!
//! # Example
//!
//! ```toml
//! port = 8080
//! base_url = "https://gateway.example.com"
//! health_endpoints = ["/healthz"]
//! cors = ["https://app.example.com", "/^https://.*\\.example\\.com$/"]
//! session_timeout_ms = 60000
//! session_reaper = "activity"
//!
//! [headers]
//! X-Gateway = "edge-1"
//!
//! [pool]
//! prefork = 2
//! max = 8
//!
//! [[routes]]
//! prefix = "/github"
//! command = "npx -y @modelcontextprotocol/server-github"
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use mcp_gateway_core::envelope::DEFAULT_PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::http::{CorsPolicy, HttpOptions, header_pairs};
use crate::pool::PoolOptions;
use crate::session::ReaperKind;

/// Child pool sizing for the SSE bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Children started eagerly (default: `1`)
    #[serde(default = "default_prefork")]
    pub prefork: usize,

    /// Upper bound on idle + active children (default: `10`)
    #[serde(default = "default_max")]
    pub max: usize,

    /// How long a client may wait for a free child. Absent waits forever.
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,
}

impl PoolConfig {
    pub fn options(&self) -> PoolOptions {
        PoolOptions {
            prefork: self.prefork,
            max: self.max.max(1),
            acquire_timeout: self.acquire_timeout_ms.map(Duration::from_millis),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            prefork: default_prefork(),
            max: default_max(),
            acquire_timeout_ms: None,
        }
    }
}

/// An extra SSE route serving its own command under `prefix`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub prefix: String,
    /// Shell command line for the route's children.
    pub command: String,
}

impl std::str::FromStr for RouteConfig {
    type Err = String;

    /// Parse `PREFIX=COMMAND`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, command) = s
            .split_once('=')
            .ok_or_else(|| format!("route `{s}` must look like PREFIX=COMMAND"))?;
        if command.trim().is_empty() {
            return Err(format!("route `{s}` has an empty command"));
        }
        Ok(Self {
            prefix: prefix.trim().to_string(),
            command: command.trim().to_string(),
        })
    }
}

/// Resolved gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listen port for server-side bridges (default: `8000`)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Public base URL prepended to the advertised SSE message endpoint
    #[serde(default)]
    pub base_url: String,

    #[serde(default = "default_sse_path")]
    pub sse_path: String,

    /// POST path for SSE, upgrade path for WebSocket
    #[serde(default = "default_message_path")]
    pub message_path: String,

    #[serde(default = "default_streamable_http_path")]
    pub streamable_http_path: String,

    /// Paths answering `ok` while the gateway is healthy
    #[serde(default)]
    pub health_endpoints: Vec<String>,

    /// Headers added to every response, and to every request in client modes
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Shorthand for an `Authorization: Bearer <token>` header
    #[serde(default)]
    pub oauth2_bearer: Option<String>,

    /// Allowed CORS origins. Absent disables CORS; empty allows any origin.
    #[serde(default)]
    pub cors: Option<Vec<String>>,

    /// Version announced by gateway-originated `initialize` requests
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    /// Idle timeout for stateful Streamable HTTP sessions
    #[serde(default)]
    pub session_timeout_ms: Option<u64>,

    #[serde(default)]
    pub session_reaper: ReaperKind,

    /// Send `{"method":"reset"}` to an SSE child before it returns to the pool
    #[serde(default = "default_reset_on_release")]
    pub reset_on_release: bool,

    /// WebSocket readiness grace when no client connects (default: `1000`)
    #[serde(default = "default_ws_connect_grace_ms")]
    pub ws_connect_grace_ms: u64,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl GatewayConfig {
    /// Configured headers plus the bearer token, as `(name, value)` pairs.
    /// Invalid entries are logged and skipped.
    pub fn header_pairs(&self) -> Vec<(axum::http::HeaderName, axum::http::HeaderValue)> {
        let bearer = self.oauth2_bearer.as_ref().map(|token| format!("Bearer {token}"));
        let pairs = self
            .headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .chain(bearer.as_deref().map(|value| ("Authorization", value)));
        header_pairs(pairs)
    }

    /// # Errors
    ///
    /// [`GatewayError::Config`] for an invalid CORS origin pattern.
    pub fn http_options(&self) -> Result<HttpOptions, GatewayError> {
        Ok(HttpOptions {
            health_endpoints: self.health_endpoints.clone(),
            headers: self.header_pairs(),
            cors: CorsPolicy::from_origins(self.cors.as_deref())?,
        })
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_ms.map(Duration::from_millis)
    }

    pub fn ws_connect_grace(&self) -> Duration {
        Duration::from_millis(self.ws_connect_grace_ms)
    }
}

/// Add a `Name: value` header string to `headers`. Malformed strings are
/// logged and skipped.
pub fn add_header_line(headers: &mut BTreeMap<String, String>, line: &str) {
    match line.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => {
            headers.insert(name.trim().to_string(), value.trim().to_string());
        }
        _ => tracing::warn!(header = line, "ignoring header without `Name: value` form"),
    }
}

fn default_port() -> u16 {
    8000
}

fn default_sse_path() -> String {
    "/sse".to_string()
}

fn default_message_path() -> String {
    "/message".to_string()
}

fn default_streamable_http_path() -> String {
    "/mcp".to_string()
}

fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_string()
}

fn default_reset_on_release() -> bool {
    true
}

fn default_ws_connect_grace_ms() -> u64 {
    1000
}

fn default_prefork() -> usize {
    1
}

fn default_max() -> usize {
    10
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            base_url: String::new(),
            sse_path: default_sse_path(),
            message_path: default_message_path(),
            streamable_http_path: default_streamable_http_path(),
            health_endpoints: Vec::new(),
            headers: BTreeMap::new(),
            oauth2_bearer: None,
            cors: None,
            protocol_version: default_protocol_version(),
            session_timeout_ms: None,
            session_reaper: ReaperKind::default(),
            reset_on_release: default_reset_on_release(),
            ws_connect_grace_ms: default_ws_connect_grace_ms(),
            pool: PoolConfig::default(),
            routes: Vec::new(),
        }
    }
}
