//! stdio → SSE.
//!
//! Every `GET <prefix><sse_path>` checks a child out of the route's pool and
//! holds it for the life of the event stream. The first event is `endpoint`,
//! naming where the client POSTs its messages; child output follows as
//! `message` events. When the stream goes away the child is detached, told
//! to `reset` (optional) and released back to the pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::{StreamExt, stream};
use mcp_gateway_core::Envelope;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{EventResult, message_event, normalize_prefix, parse_envelope};
use crate::child::{ChildEvent, ChildHandle};
use crate::pool::ChildPool;
use crate::session::new_session_id;

/// Method of the notification written to a child before it returns to the
/// pool.
pub const RESET_METHOD: &str = "reset";

#[derive(Debug, Clone)]
pub struct SseOptions {
    /// Prepended to the message endpoint when non-empty.
    pub base_url: String,
    pub sse_path: String,
    pub message_path: String,
    pub reset_on_release: bool,
}

impl Default for SseOptions {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            sse_path: "/sse".to_string(),
            message_path: "/message".to_string(),
            reset_on_release: true,
        }
    }
}

/// One upstream command mounted under a path prefix.
#[derive(Debug, Clone)]
pub struct SseRoute {
    pub prefix: String,
    pub pool: ChildPool,
}

struct RouteState {
    pool: ChildPool,
    sessions: Mutex<HashMap<String, ChildHandle>>,
    message_endpoint: String,
    reset_on_release: bool,
    span: tracing::Span,
}

impl RouteState {
    fn sessions(&self) -> MutexGuard<'_, HashMap<String, ChildHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Build the subscribe/message routes for every upstream command.
pub fn router(routes: Vec<SseRoute>, options: &SseOptions) -> Router {
    let base_url = options.base_url.trim_end_matches('/');
    routes.into_iter().fold(Router::new(), |router, route| {
        let prefix = normalize_prefix(&route.prefix);
        let subscribe_path = format!("{prefix}{}", options.sse_path);
        let message_path = format!("{prefix}{}", options.message_path);
        let label = if prefix.is_empty() { "/" } else { prefix.as_str() };
        let state = Arc::new(RouteState {
            pool: route.pool,
            sessions: Mutex::new(HashMap::new()),
            message_endpoint: format!("{base_url}{message_path}"),
            reset_on_release: options.reset_on_release,
            span: tracing::info_span!("sse", route = %label),
        });
        state.span.in_scope(|| {
            info!(subscribe = %subscribe_path, message = %message_path, "SSE route mounted")
        });
        router.merge(
            Router::new()
                .route(&subscribe_path, get(subscribe))
                .route(&message_path, post(message))
                .with_state(state),
        )
    })
}

/// Owns one SSE connection's child. Dropping it ends the session.
struct SseSession {
    state: Arc<RouteState>,
    id: String,
    child: ChildHandle,
    span: tracing::Span,
}

impl Drop for SseSession {
    fn drop(&mut self) {
        let _entered = self.span.enter();
        self.state.sessions().remove(&self.id);
        self.child.detach();
        if self.state.reset_on_release && self.child.is_alive() {
            if let Err(e) = self.child.send(&Envelope::notification(RESET_METHOD, None)) {
                debug!(error = %e, "could not reset child before release");
            }
        }
        self.state.pool.release(self.child.clone());
        info!("SSE client disconnected");
    }
}

async fn subscribe(State(state): State<Arc<RouteState>>) -> Response {
    let child = match state.pool.acquire().await {
        Ok(child) => child,
        Err(e) => {
            state
                .span
                .in_scope(|| warn!(error = %e, "no child process for SSE connection"));
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("No child process available: {e}"),
            )
                .into_response();
        }
    };

    let session_id = new_session_id();
    let events = child.attach();
    state.sessions().insert(session_id.clone(), child.clone());
    let span = tracing::info_span!(parent: &state.span, "session", id = %session_id, child = child.id());
    span.in_scope(|| info!("SSE client connected"));

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("{}?sessionId={session_id}", state.message_endpoint));
    let session = SseSession {
        state,
        id: session_id,
        child,
        span,
    };

    let messages = stream::unfold((events, session), |(mut events, session)| async move {
        match events.recv().await {
            Some(ChildEvent::Message(envelope)) => {
                Some((Ok(message_event(&envelope)), (events, session)))
            }
            Some(ChildEvent::Exited(info)) => {
                session
                    .span
                    .in_scope(|| warn!(%info, "child exited; closing event stream"));
                None
            }
            None => None,
        }
    });
    let stream = stream::once(async move { EventResult::Ok(endpoint) }).chain(messages);
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

async fn message(
    State(state): State<Arc<RouteState>>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> Response {
    let Some(session_id) = query.session_id.filter(|id| !id.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing sessionId parameter").into_response();
    };
    let child = state.sessions().get(&session_id).cloned();
    let Some(child) = child else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("No active SSE connection for session {session_id}"),
        )
            .into_response();
    };
    let envelope = match parse_envelope(&body) {
        Ok(envelope) => envelope,
        Err(malformed) => {
            state
                .span
                .in_scope(|| warn!(session = %session_id, ?malformed, "rejecting client message"));
            return malformed.into_response();
        }
    };
    match child.send(&envelope) {
        Ok(()) => (StatusCode::ACCEPTED, "Accepted").into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::child::{MemoryPeer, MemorySpawner};
    use crate::http::Server;
    use crate::pool::PoolOptions;
    use mcp_gateway_core::RequestId;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn memory_pool(max: usize) -> (ChildPool, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (spawner, peers) = MemorySpawner::new();
        let pool = ChildPool::new(
            Arc::new(spawner),
            PoolOptions {
                prefork: 0,
                max,
                acquire_timeout: Some(Duration::from_millis(200)),
            },
        );
        (pool, peers)
    }

    fn app(pool: ChildPool, options: &SseOptions) -> Router {
        router(
            vec![SseRoute {
                prefix: String::new(),
                pool,
            }],
            options,
        )
    }

    async fn post(router: Router, uri: &str, body: &str) -> (StatusCode, String) {
        let request = axum::http::Request::post(uri)
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body.to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn post_without_or_with_unknown_session_is_rejected() {
        let (pool, _peers) = memory_pool(1);
        let router = app(pool, &SseOptions::default());

        let (status, body) = post(router.clone(), "/message", "{}").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Missing sessionId parameter");

        let (status, body) = post(router, "/message?sessionId=nope", "{}").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "No active SSE connection for session nope");
    }

    /// Read SSE text until `needle` shows up.
    async fn read_until(response: &mut reqwest::Response, seen: &mut String, needle: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !seen.contains(needle) {
                let chunk = response.chunk().await.unwrap().expect("stream ended");
                seen.push_str(&String::from_utf8_lossy(&chunk));
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn session_round_trip_and_release_on_disconnect() {
        let (pool, mut peers) = memory_pool(1);
        let options = SseOptions {
            base_url: "http://gateway.test/".to_string(),
            ..SseOptions::default()
        };
        let server = Server::bind(0, app(pool.clone(), &options)).await.unwrap();
        let base = format!("http://127.0.0.1:{}", server.local_addr().port());
        let client = reqwest::Client::new();

        let mut stream = client.get(format!("{base}/sse")).send().await.unwrap();
        let mut seen = String::new();
        read_until(&mut stream, &mut seen, "sessionId=").await;
        assert!(seen.contains("event: endpoint"));
        assert!(seen.contains("data: http://gateway.test/message?sessionId="));
        let session_id = seen
            .split("sessionId=")
            .nth(1)
            .and_then(|rest| rest.lines().next())
            .unwrap()
            .trim()
            .to_string();
        let mut peer = peers.recv().await.unwrap();

        let bad = client
            .post(format!("{base}/message?sessionId={session_id}"))
            .body("not json")
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST);
        let bad: serde_json::Value = bad.json().await.unwrap();
        assert_eq!(bad["error"]["code"], -32700);

        let accepted = client
            .post(format!("{base}/message?sessionId={session_id}"))
            .body(Envelope::request(1, "tools/list", None).to_line())
            .send()
            .await
            .unwrap();
        assert_eq!(accepted.status(), reqwest::StatusCode::ACCEPTED);
        assert_eq!(peer.recv().await.unwrap().id(), Some(&RequestId::from(1)));

        peer.send(&Envelope::success(1.into(), json!({"tools": []})))
            .await
            .unwrap();
        read_until(&mut stream, &mut seen, "\"tools\":[]").await;
        assert!(seen.contains("event: message"));
        assert_eq!(pool.stats().active, 1);

        drop(stream);
        // The server notices the closed connection on its next write.
        tokio::time::timeout(Duration::from_secs(5), async {
            while pool.stats().idle != 1 {
                let _ = peer.send(&Envelope::notification("notifications/message", None)).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        let reset = peer.recv().await.unwrap();
        assert_eq!(reset.method(), Some(RESET_METHOD));

        server.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_pool_answers_unavailable() {
        let (pool, _peers) = memory_pool(1);
        let _held = pool.acquire().await.unwrap();
        let response = app(pool, &SseOptions::default())
            .oneshot(
                axum::http::Request::get("/sse")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn routes_are_mounted_under_prefixes() {
        let (first, _p1) = memory_pool(1);
        let (second, _p2) = memory_pool(1);
        let router = router(
            vec![
                SseRoute {
                    prefix: String::new(),
                    pool: first,
                },
                SseRoute {
                    prefix: "github".to_string(),
                    pool: second,
                },
            ],
            &SseOptions::default(),
        );
        let (status, _) = post(router.clone(), "/github/message?sessionId=x", "{}").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = post(router, "/gitlab/message?sessionId=x", "{}").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
