//! stdio → WebSocket.
//!
//! One child serves every socket. Requests coming in from a socket get their
//! id rewritten to `<clientId>:<original id as JSON>` so that the child's
//! response can be routed back to that socket with the original id restored.
//! Anything the child sends that is not such a response is broadcast.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use mcp_gateway_core::{Envelope, ErrorCode, RequestId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Malformed, parse_envelope};
use crate::child::{ChildEvent, ChildHandle, ExitInfo};
use crate::http::HealthCheck;

/// Rewrite `id` into the namespace of `client_id`.
pub fn namespace_id(client_id: &str, id: &RequestId) -> RequestId {
    RequestId::String(format!("{client_id}:{}", id.to_json()))
}

/// Split a namespaced id back into client id and original id.
pub fn split_id(id: &RequestId) -> Option<(&str, RequestId)> {
    let RequestId::String(raw) = id else {
        return None;
    };
    let (client_id, original) = raw.split_once(':')?;
    if client_id.is_empty() {
        return None;
    }
    RequestId::from_json(original).map(|original| (client_id, original))
}

type Outbox = mpsc::UnboundedSender<String>;

/// Routes traffic between the shared child and connected sockets.
pub struct WsHub {
    child: ChildHandle,
    clients: Mutex<HashMap<String, Outbox>>,
    ready: AtomicBool,
    span: tracing::Span,
}

impl std::fmt::Debug for WsHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsHub")
            .field("child", &self.child)
            .field("clients", &self.clients().len())
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl WsHub {
    pub fn new(child: ChildHandle) -> Arc<Self> {
        let span = tracing::info_span!("ws", child = child.id());
        Arc::new(Self {
            child,
            clients: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(false),
            span,
        })
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<String, Outbox>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn mark_ready(&self) {
        if !self.ready.swap(true, Ordering::SeqCst) {
            self.span.in_scope(|| info!("WebSocket bridge ready"));
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients().len()
    }

    /// Register a new socket. Returns its client id and the queue of text
    /// frames to write to it. The queue closes when the hub drops the client.
    pub fn connect(&self) -> (String, mpsc::UnboundedReceiver<String>) {
        let client_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients().insert(client_id.clone(), tx);
        self.mark_ready();
        self.span
            .in_scope(|| info!(client = %client_id, "WebSocket client connected"));
        (client_id, rx)
    }

    pub fn disconnect(&self, client_id: &str) {
        if self.clients().remove(client_id).is_some() {
            self.span
                .in_scope(|| info!(client = %client_id, "WebSocket client disconnected"));
        }
    }

    /// Handle one text frame from a client.
    pub fn from_client(&self, client_id: &str, text: &str) {
        let mut envelope = match parse_envelope(text) {
            Ok(envelope) => envelope,
            Err(malformed) => {
                self.span
                    .in_scope(|| warn!(client = %client_id, ?malformed, "invalid message from client"));
                let (code, reason) = match malformed {
                    Malformed::Parse(reason) => (ErrorCode::ParseError, reason),
                    Malformed::Invalid(reason) => (ErrorCode::InvalidRequest, reason),
                };
                self.send_to(client_id, &Envelope::error_response(RequestId::Null, code, reason));
                return;
            }
        };
        if let Envelope::Request { id, .. } = &envelope {
            let namespaced = namespace_id(client_id, id);
            envelope.replace_id(namespaced);
        }
        if let Err(e) = self.child.send(&envelope) {
            self.span
                .in_scope(|| warn!(client = %client_id, error = %e, "could not forward message to child"));
            if let Some(id) = envelope.id().and_then(split_id).map(|(_, id)| id) {
                let reply = Envelope::error_response(id, ErrorCode::ServerError, e.to_string());
                self.send_to(client_id, &reply);
            }
        }
    }

    /// Route one message from the child.
    pub fn dispatch(&self, mut envelope: Envelope) {
        if let Envelope::Response { id, .. } = &envelope {
            if let Some((client_id, original)) = split_id(id) {
                let client_id = client_id.to_string();
                envelope.replace_id(original);
                if !self.send_to(&client_id, &envelope) {
                    self.span
                        .in_scope(|| debug!(client = %client_id, "response for a departed client dropped"));
                }
                return;
            }
        }
        self.broadcast(&envelope);
    }

    fn send_to(&self, client_id: &str, envelope: &Envelope) -> bool {
        let mut clients = self.clients();
        let Some(tx) = clients.get(client_id) else {
            return false;
        };
        if tx.send(envelope.to_line()).is_ok() {
            return true;
        }
        clients.remove(client_id);
        false
    }

    fn broadcast(&self, envelope: &Envelope) {
        let line = envelope.to_line();
        self.clients().retain(|_, tx| tx.send(line.clone()).is_ok());
    }

    /// Drive the hub until the child exits. Every client queue is closed on
    /// return.
    pub async fn run(self: Arc<Self>) -> ExitInfo {
        let mut events = self.child.attach();
        let info = loop {
            match events.recv().await {
                Some(ChildEvent::Message(envelope)) => self.dispatch(envelope),
                Some(ChildEvent::Exited(info)) => break info,
                None => break self.child.exited().await,
            }
        };
        self.span
            .in_scope(|| warn!(%info, "child process exited; closing all WebSocket clients"));
        self.clients().clear();
        info
    }

    /// Mark the hub ready once `grace` has passed, even with no client.
    pub fn start_grace(self: &Arc<Self>, grace: Duration) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            hub.mark_ready();
        });
    }

    /// Health probe: unhealthy once the child is gone or before start-up.
    pub fn health_check(self: &Arc<Self>) -> HealthCheck {
        let hub = Arc::clone(self);
        Arc::new(move || {
            if !hub.child.is_alive() {
                Err("Child process has been killed".to_string())
            } else if !hub.is_ready() {
                Err("Server is not ready".to_string())
            } else {
                Ok(())
            }
        })
    }

    /// Stop the shared child.
    pub fn shutdown(&self) {
        self.child.detach();
        self.child.kill();
    }
}

/// The upgrade route.
pub fn router(hub: Arc<WsHub>, path: &str) -> Router {
    Router::new().route(path, get(upgrade)).with_state(hub)
}

async fn upgrade(State(hub): State<Arc<WsHub>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_socket(hub, socket))
}

async fn serve_socket(hub: Arc<WsHub>, socket: WebSocket) {
    let (client_id, mut outbox) = hub.connect();
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            outgoing = outbox.recv() => {
                let Some(text) = outgoing else { break };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => hub.from_client(&client_id, text.as_str()),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => hub.from_client(&client_id, text),
                    Err(_) => debug!(client = %client_id, "ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    hub.disconnect(&client_id);
    let _ = sink.close().await;
}
