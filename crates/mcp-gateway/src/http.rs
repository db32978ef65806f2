//! HTTP surface shared by the server-side bridges: health endpoints,
//! configured response headers, CORS, and the listener itself.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header, request};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use mcp_gateway_core::{Envelope, RequestId};
use regex::Regex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{info, warn};

use crate::error::GatewayError;

/// Header carrying the Streamable HTTP session id.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Returns `Err(reason)` when the gateway should report unhealthy.
pub type HealthCheck = Arc<dyn Fn() -> Result<(), String> + Send + Sync>;

/// One allowed origin.
#[derive(Debug, Clone)]
pub enum OriginMatcher {
    Exact(String),
    Pattern(Regex),
}

impl OriginMatcher {
    pub fn matches(&self, origin: &str) -> bool {
        match self {
            Self::Exact(allowed) => allowed == origin,
            Self::Pattern(re) => re.is_match(origin),
        }
    }
}

/// Cross-origin policy applied to every route.
#[derive(Debug, Clone, Default)]
pub enum CorsPolicy {
    #[default]
    Disabled,
    Any,
    Origins(Vec<OriginMatcher>),
}

impl CorsPolicy {
    /// `None` disables CORS; an empty list or `*` allows any origin; entries
    /// wrapped in slashes (`/^https://.*\.example\.com$/`) are regexes.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Config`] for an invalid regex.
    pub fn from_origins(origins: Option<&[String]>) -> Result<Self, GatewayError> {
        let Some(origins) = origins else {
            return Ok(Self::Disabled);
        };
        if origins.is_empty() || origins.iter().any(|o| o.trim() == "*") {
            return Ok(Self::Any);
        }
        let matchers = origins
            .iter()
            .map(|raw| {
                let raw = raw.trim();
                match raw.strip_prefix('/').and_then(|r| r.strip_suffix('/')) {
                    Some(pattern) if !pattern.is_empty() => Regex::new(pattern)
                        .map(OriginMatcher::Pattern)
                        .map_err(|e| GatewayError::Config(format!("invalid CORS origin regex {raw}: {e}"))),
                    _ => Ok(OriginMatcher::Exact(raw.to_string())),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::Origins(matchers))
    }

    pub fn layer(&self) -> Option<CorsLayer> {
        let origin = match self {
            Self::Disabled => return None,
            Self::Any => AllowOrigin::any(),
            Self::Origins(matchers) => {
                let matchers = matchers.clone();
                AllowOrigin::predicate(move |origin: &HeaderValue, _: &request::Parts| {
                    origin
                        .to_str()
                        .map(|o| matchers.iter().any(|m| m.matches(o)))
                        .unwrap_or(false)
                })
            }
        };
        Some(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers(Any)
                .expose_headers([HeaderName::from_static(SESSION_HEADER)]),
        )
    }
}

/// Everything the bridges need to finish a router.
#[derive(Debug, Clone, Default)]
pub struct HttpOptions {
    pub health_endpoints: Vec<String>,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub cors: CorsPolicy,
}

/// Convert configured header pairs, skipping (and logging) invalid ones.
pub fn header_pairs<'a, I>(pairs: I) -> Vec<(HeaderName, HeaderValue)>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .filter_map(|(name, value)| {
            match (HeaderName::try_from(name.trim()), HeaderValue::try_from(value.trim())) {
                (Ok(name), Ok(value)) => Some((name, value)),
                _ => {
                    warn!(header = %name, "ignoring invalid header");
                    None
                }
            }
        })
        .collect()
}

/// Add health routes, response headers and CORS to a bridge router.
pub fn finish(router: Router, options: &HttpOptions, check: Option<HealthCheck>) -> Router {
    let mut router = router;
    for path in &options.health_endpoints {
        let check = check.clone();
        router = router.route(
            path,
            get(move || async move {
                match check.as_ref().map(|c| c()) {
                    Some(Err(reason)) => (StatusCode::INTERNAL_SERVER_ERROR, reason).into_response(),
                    _ => "ok".into_response(),
                }
            }),
        );
    }
    for (name, value) in &options.headers {
        router = router.layer(SetResponseHeaderLayer::overriding(name.clone(), value.clone()));
    }
    if let Some(cors) = options.cors.layer() {
        router = router.layer(cors);
    }
    router
}

/// A JSON-RPC error envelope with a null id, as an HTTP response.
pub fn rpc_error(status: StatusCode, code: impl Into<i64>, message: &str) -> Response {
    json_response(status, &Envelope::error_response(RequestId::Null, code, message))
}

pub fn json_response(status: StatusCode, envelope: &Envelope) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        envelope.to_line(),
    )
        .into_response()
}

/// Whether the `Accept` header admits an event stream.
pub fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("text/event-stream") || v.contains("*/*"))
}

pub fn session_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// A running HTTP listener.
pub struct Server {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

impl Server {
    /// Bind on all interfaces and start serving. Port 0 picks a free port.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Bind`] if the port cannot be bound.
    pub async fn bind(port: u16, router: Router) -> Result<Self, GatewayError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let addr = listener.local_addr()?;
        info!(%addr, "listening");

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        });
        Ok(Self { addr, cancel, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections; open connections get `grace` to finish.
    ///
    /// # Errors
    ///
    /// Returns the serve loop's I/O error, if it failed.
    pub async fn stop(mut self, grace: Duration) -> Result<(), GatewayError> {
        self.cancel.cancel();
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(result)) => result.map_err(GatewayError::from),
            Ok(Err(join)) => Err(std::io::Error::other(join).into()),
            Err(_) => {
                warn!("connections still open after shutdown grace; closing");
                self.task.abort();
                Ok(())
            }
        }
    }
}

/// Resolve on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
