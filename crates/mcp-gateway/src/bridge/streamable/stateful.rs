//! stdio → Streamable HTTP, one pinned child per session.
//!
//! An `initialize` POST without a session header creates a session: a child
//! is spawned, pinned to a fresh session id, and the id is returned in the
//! `mcp-session-id` header. Later requests carry that header. Sessions end
//! on DELETE, when their child exits, or when the configured reaper decides
//! they have been idle long enough.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use mcp_gateway_core::{Envelope, ErrorCode};
use tracing::{error, info};

use super::transport::{StreamTransport, parse_body, respond, standalone_response};
use crate::child::{ChildHandle, ChildSpawner};
use crate::error::GatewayError;
use crate::http::{accepts_event_stream, rpc_error, session_id};
use crate::session::{AccessGuard, CleanupFn, ReaperKind, SessionReaper, new_session_id};

#[derive(Debug, Clone, Default)]
pub struct StatefulOptions {
    /// Idle time after which a session is reaped. `None` keeps sessions
    /// until DELETE or child exit.
    pub session_timeout: Option<Duration>,
    pub reaper: ReaperKind,
}

struct BridgeState {
    spawner: Arc<dyn ChildSpawner>,
    sessions: Mutex<HashMap<String, Arc<StreamTransport>>>,
    reaper: Option<Arc<dyn SessionReaper>>,
    next_child: AtomicU64,
    span: tracing::Span,
}

impl BridgeState {
    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<StreamTransport>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self, id: &str) -> Option<Arc<StreamTransport>> {
        self.sessions().get(id).cloned()
    }

    fn create_session(self: &Arc<Self>) -> Result<(String, Arc<StreamTransport>), GatewayError> {
        let io = self.spawner.spawn()?;
        let child = ChildHandle::start(self.next_child.fetch_add(1, Ordering::Relaxed), io);
        let id = new_session_id();
        let span = tracing::info_span!(parent: &self.span, "session", id = %id, child = child.id());
        let transport = StreamTransport::start(child.clone(), None, span);
        self.sessions().insert(id.clone(), Arc::clone(&transport));
        transport.span().in_scope(|| info!("session initialized"));

        let weak = Arc::downgrade(self);
        let session = id.clone();
        tokio::spawn(async move {
            let info = child.exited().await;
            if let Some(state) = weak.upgrade() {
                state.close_session(&session, &format!("child exited ({info})"));
            }
        });
        Ok((id, transport))
    }

    /// Remove a session and stop its child. Unknown ids are ignored.
    fn close_session(&self, id: &str, reason: &str) -> bool {
        let Some(transport) = self.sessions().remove(id) else {
            return false;
        };
        if let Some(reaper) = &self.reaper {
            reaper.forget(id);
        }
        transport.child().kill();
        transport.span().in_scope(|| info!(reason, "session closed"));
        true
    }

    fn access(&self, id: &str) -> Option<AccessGuard> {
        self.reaper
            .as_ref()
            .map(|reaper| AccessGuard::new(Arc::clone(reaper), id))
    }
}

/// Stateful Streamable HTTP bridge. Cloning shares the session table.
#[derive(Clone)]
pub struct StatefulBridge {
    state: Arc<BridgeState>,
}

impl StatefulBridge {
    pub fn new(spawner: Arc<dyn ChildSpawner>, options: &StatefulOptions) -> Self {
        let span = tracing::info_span!("streamable", mode = "stateful", command = %spawner.describe());
        let state = Arc::new_cyclic(|weak: &Weak<BridgeState>| {
            let reaper = options.session_timeout.map(|timeout| {
                let weak = weak.clone();
                let cleanup: CleanupFn = Arc::new(move |id: &str| {
                    if let Some(state) = weak.upgrade() {
                        state.close_session(id, "idle timeout");
                    }
                });
                options.reaper.build(timeout, cleanup)
            });
            BridgeState {
                spawner,
                sessions: Mutex::new(HashMap::new()),
                reaper,
                next_child: AtomicU64::new(1),
                span,
            }
        });
        Self { state }
    }

    pub fn router(&self, path: &str) -> Router {
        Router::new()
            .route(
                path,
                post(handle_post).get(handle_get).delete(handle_delete),
            )
            .with_state(Arc::clone(&self.state))
    }

    pub fn session_count(&self) -> usize {
        self.state.sessions().len()
    }

    /// Close every session.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.state.sessions().keys().cloned().collect();
        for id in ids {
            self.state.close_session(&id, "gateway shutting down");
        }
    }
}

async fn handle_post(State(state): State<Arc<BridgeState>>, headers: HeaderMap, body: String) -> Response {
    let (messages, batch) = match parse_body(&body) {
        Ok(parsed) => parsed,
        Err(malformed) => return malformed.into_response(),
    };

    let (id, transport) = match session_id(&headers) {
        Some(id) => match state.session(id) {
            Some(transport) => (id.to_string(), transport),
            None => {
                return rpc_error(StatusCode::NOT_FOUND, ErrorCode::SessionNotFound, "Session not found");
            }
        },
        None if messages.iter().any(Envelope::is_initialize_request) => match state.create_session() {
            Ok(created) => created,
            Err(e) => {
                state
                    .span
                    .in_scope(|| error!(error = %e, "could not start child for new session"));
                return rpc_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::InternalError,
                    "Internal server error",
                );
            }
        },
        None => {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                ErrorCode::ServerError,
                "Bad Request: No valid session ID provided",
            );
        }
    };

    let access = state.access(&id);
    match transport.exchange(messages) {
        Ok(exchange) => respond(exchange, batch, accepts_event_stream(&headers), Some(&id), access).await,
        Err(e) => {
            transport
                .span()
                .in_scope(|| error!(error = %e, "could not forward request to child"));
            rpc_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::InternalError,
                "Internal server error",
            )
        }
    }
}

fn invalid_session() -> Response {
    (StatusCode::BAD_REQUEST, "Invalid or missing session ID").into_response()
}

async fn handle_get(State(state): State<Arc<BridgeState>>, headers: HeaderMap) -> Response {
    let Some((id, transport)) = session_id(&headers).and_then(|id| Some((id.to_string(), state.session(id)?)))
    else {
        return invalid_session();
    };
    if !accepts_event_stream(&headers) {
        return rpc_error(
            StatusCode::NOT_ACCEPTABLE,
            ErrorCode::ServerError,
            "Not Acceptable: Client must accept text/event-stream",
        );
    }
    let Some(standalone) = transport.open_standalone() else {
        return rpc_error(
            StatusCode::CONFLICT,
            ErrorCode::ServerError,
            "Conflict: Only one SSE stream is allowed per session",
        );
    };
    let access = state.access(&id);
    standalone_response(standalone, &id, access)
}

async fn handle_delete(State(state): State<Arc<BridgeState>>, headers: HeaderMap) -> Response {
    match session_id(&headers) {
        Some(id) if state.close_session(id, "terminated by client") => StatusCode::OK.into_response(),
        _ => invalid_session(),
    }
}
