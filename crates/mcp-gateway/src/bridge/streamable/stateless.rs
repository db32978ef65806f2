//! stdio → Streamable HTTP, one child per request.
//!
//! Every POST gets a freshly spawned child and its own transport, so request
//! ids from different clients can never meet. The child is auto-initialized
//! when the client skips `initialize`, and killed once the reply is done or
//! the client goes away.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::post;
use mcp_gateway_core::ErrorCode;
use tracing::{debug, error};

use super::transport::{StreamTransport, parse_body, respond};
use crate::child::{ChildHandle, ChildSpawner};
use crate::handshake::Handshake;
use crate::http::{accepts_event_stream, rpc_error};

struct BridgeState {
    spawner: Arc<dyn ChildSpawner>,
    protocol_version: String,
    next_child: AtomicU64,
    span: tracing::Span,
}

/// Kills its child when dropped.
struct ChildLease(ChildHandle);

impl Drop for ChildLease {
    fn drop(&mut self) {
        self.0.kill();
        self.0.span().in_scope(|| debug!("request finished; child released"));
    }
}

#[derive(Clone)]
pub struct StatelessBridge {
    state: Arc<BridgeState>,
}

impl StatelessBridge {
    pub fn new(spawner: Arc<dyn ChildSpawner>, protocol_version: impl Into<String>) -> Self {
        let span = tracing::info_span!("streamable", mode = "stateless", command = %spawner.describe());
        Self {
            state: Arc::new(BridgeState {
                spawner,
                protocol_version: protocol_version.into(),
                next_child: AtomicU64::new(1),
                span,
            }),
        }
    }

    pub fn router(&self, path: &str) -> Router {
        Router::new()
            .route(
                path,
                post(handle_post).get(method_not_allowed).delete(method_not_allowed),
            )
            .with_state(Arc::clone(&self.state))
    }
}

fn internal_error() -> Response {
    rpc_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::InternalError,
        "Internal server error",
    )
}

async fn handle_post(State(state): State<Arc<BridgeState>>, headers: HeaderMap, body: String) -> Response {
    let (messages, batch) = match parse_body(&body) {
        Ok(parsed) => parsed,
        Err(malformed) => return malformed.into_response(),
    };

    let io = match state.spawner.spawn() {
        Ok(io) => io,
        Err(e) => {
            state
                .span
                .in_scope(|| error!(error = %e, "could not start child for request"));
            return internal_error();
        }
    };
    let child = ChildHandle::start(state.next_child.fetch_add(1, Ordering::Relaxed), io);
    let span = tracing::info_span!(parent: &state.span, "request", child = child.id());
    let lease = ChildLease(child.clone());
    let transport = StreamTransport::start(
        child,
        Some(Handshake::new(state.protocol_version.clone())),
        span,
    );

    match transport.exchange(messages) {
        Ok(exchange) => respond(exchange, batch, accepts_event_stream(&headers), None, lease).await,
        Err(e) => {
            transport
                .span()
                .in_scope(|| error!(error = %e, "could not forward request to child"));
            internal_error()
        }
    }
}

async fn method_not_allowed() -> Response {
    rpc_error(
        StatusCode::METHOD_NOT_ALLOWED,
        ErrorCode::ServerError,
        "Method not allowed.",
    )
}
