//! Per-child plumbing shared by both Streamable HTTP bridges.
//!
//! A [`StreamTransport`] owns the listener of one child. Each POST that
//! carries requests opens an [`Exchange`]: the request ids are registered
//! before anything is written, so a response can never race its route.
//! Child notifications and requests go to the standalone GET stream if one
//! is open, else to the oldest open exchange, else nowhere. Responses only
//! ever go to the exchange that registered their id.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream;
use mcp_gateway_core::{Envelope, ErrorCode, RequestId};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;
use tracing::{Instrument, debug, warn};

use crate::bridge::{EventResult, Malformed, message_event};
use crate::child::{ChildEvent, ChildHandle, ExitInfo};
use crate::error::GatewayError;
use crate::handshake::{Handshake, Inbound};
use crate::http::SESSION_HEADER;

type Route = mpsc::UnboundedSender<Envelope>;

#[derive(Default)]
struct Routes {
    pending: HashMap<RequestId, u64>,
    exchanges: BTreeMap<u64, Route>,
    standalone: Option<(u64, Route)>,
    next_stream: u64,
    closed: bool,
}

impl Routes {
    fn next_stream(&mut self) -> u64 {
        self.next_stream += 1;
        self.next_stream
    }
}

/// Routes one child's output to the HTTP streams waiting for it.
pub struct StreamTransport {
    child: ChildHandle,
    routes: Mutex<Routes>,
    handshake: Option<Mutex<Handshake>>,
    span: tracing::Span,
}

impl StreamTransport {
    /// Attach to `child` and start routing its output. With a handshake,
    /// every write goes through it.
    pub fn start(child: ChildHandle, handshake: Option<Handshake>, span: tracing::Span) -> Arc<Self> {
        let events = child.attach();
        let transport = Arc::new(Self {
            child,
            routes: Mutex::new(Routes::default()),
            handshake: handshake.map(Mutex::new),
            span: span.clone(),
        });
        tokio::spawn(Arc::clone(&transport).pump(events).instrument(span));
        transport
    }

    pub fn child(&self) -> &ChildHandle {
        &self.child
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write the client's messages to the child. Returns the exchange that
    /// will carry the responses, or `None` if no message was a request.
    ///
    /// # Errors
    ///
    /// [`GatewayError::ChildGone`] once the child has exited, or a write
    /// failure.
    pub fn exchange(self: &Arc<Self>, messages: Vec<Envelope>) -> Result<Option<Exchange>, GatewayError> {
        let requests: HashSet<RequestId> = messages
            .iter()
            .filter(|m| m.is_request())
            .filter_map(|m| m.id().cloned())
            .collect();
        let exchange = if requests.is_empty() {
            None
        } else {
            let mut routes = self.routes();
            if routes.closed {
                return Err(GatewayError::ChildGone { id: self.child.id() });
            }
            let stream_id = routes.next_stream();
            let (tx, rx) = mpsc::unbounded_channel();
            routes.exchanges.insert(stream_id, tx);
            for id in &requests {
                routes.pending.insert(id.clone(), stream_id);
            }
            Some(Exchange {
                transport: Arc::clone(self),
                stream_id,
                rx,
                remaining: requests,
            })
        };
        for message in messages {
            self.write(message)?;
        }
        Ok(exchange)
    }

    /// Open the standalone push stream. Returns `None` if one is already
    /// open.
    pub fn open_standalone(self: &Arc<Self>) -> Option<Standalone> {
        let mut routes = self.routes();
        if routes
            .standalone
            .as_ref()
            .is_some_and(|(_, tx)| !tx.is_closed())
        {
            return None;
        }
        let stream_id = routes.next_stream();
        let (tx, rx) = mpsc::unbounded_channel();
        if !routes.closed {
            routes.standalone = Some((stream_id, tx));
        }
        Some(Standalone {
            transport: Arc::clone(self),
            stream_id,
            rx,
        })
    }

    fn write(&self, message: Envelope) -> Result<(), GatewayError> {
        let Some(handshake) = &self.handshake else {
            return self.child.send(&message);
        };
        // Held across the sends so handshake traffic keeps its order.
        let mut handshake = handshake.lock().unwrap_or_else(PoisonError::into_inner);
        for outgoing in handshake.outbound(message) {
            self.child.send(&outgoing)?;
        }
        Ok(())
    }

    async fn pump(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ChildEvent>) {
        let mut exit = None;
        while let Some(event) = events.recv().await {
            match event {
                ChildEvent::Message(envelope) => self.inbound(envelope),
                ChildEvent::Exited(info) => {
                    exit = Some(info);
                    break;
                }
            }
        }
        self.close(exit);
    }

    fn inbound(&self, envelope: Envelope) {
        let envelope = match &self.handshake {
            None => envelope,
            Some(handshake) => {
                let mut handshake = handshake.lock().unwrap_or_else(PoisonError::into_inner);
                match handshake.inbound(envelope) {
                    Inbound::Forward(envelope) => envelope,
                    Inbound::Swallow { then_send } => {
                        for outgoing in then_send {
                            if let Err(e) = self.child.send(&outgoing) {
                                warn!(error = %e, "could not release deferred message");
                            }
                        }
                        return;
                    }
                }
            }
        };
        self.route(envelope);
    }

    fn route(&self, mut envelope: Envelope) {
        let mut routes = self.routes();
        let owner = match &envelope {
            Envelope::Response { id, .. } => routes.pending.remove(id),
            _ => None,
        };
        if let Some(stream_id) = owner {
            let Some(tx) = routes.exchanges.get(&stream_id) else {
                debug!(id = ?envelope.id(), "response for a closed request stream dropped");
                return;
            };
            if tx.send(envelope).is_err() {
                debug!("request stream closed before its response arrived");
            }
            return;
        }
        if envelope.is_response() {
            debug!(id = ?envelope.id(), "response matches no open request; dropped");
            return;
        }
        if let Some((_, tx)) = &routes.standalone {
            match tx.send(envelope) {
                Ok(()) => return,
                Err(SendError(returned)) => envelope = returned,
            }
        }
        if let Some(tx) = routes.exchanges.values().next() {
            match tx.send(envelope) {
                Ok(()) => return,
                Err(SendError(returned)) => envelope = returned,
            }
        }
        debug!(method = ?envelope.method(), id = ?envelope.id(), "no open stream for child message; dropped");
    }

    /// Stop routing: every open stream ends after what it already holds.
    fn close(&self, exit: Option<ExitInfo>) {
        let mut routes = self.routes();
        routes.closed = true;
        routes.pending.clear();
        routes.exchanges.clear();
        routes.standalone = None;
        drop(routes);
        match exit {
            Some(info) => warn!(%info, "child exited; closing its streams"),
            None => debug!("child output detached; closing its streams"),
        }
    }

    fn release_exchange(&self, stream_id: u64) {
        let mut routes = self.routes();
        routes.exchanges.remove(&stream_id);
        routes.pending.retain(|_, s| *s != stream_id);
    }

    fn release_standalone(&self, stream_id: u64) {
        let mut routes = self.routes();
        if routes.standalone.as_ref().is_some_and(|(s, _)| *s == stream_id) {
            routes.standalone = None;
        }
    }
}

/// The reply leg of one POST.
pub struct Exchange {
    transport: Arc<StreamTransport>,
    stream_id: u64,
    rx: mpsc::UnboundedReceiver<Envelope>,
    remaining: HashSet<RequestId>,
}

impl Exchange {
    /// Next message for this POST; `None` once every request is answered.
    /// If the child goes away first, the unanswered requests get error
    /// responses.
    pub async fn next(&mut self) -> Option<Envelope> {
        if self.remaining.is_empty() {
            return None;
        }
        match self.rx.recv().await {
            Some(envelope) => {
                if let Envelope::Response { id, .. } = &envelope {
                    self.remaining.remove(id);
                }
                Some(envelope)
            }
            None => {
                let id = self.remaining.iter().next().cloned()?;
                self.remaining.remove(&id);
                Some(Envelope::error_response(
                    id,
                    ErrorCode::ServerError,
                    "Child process exited before responding",
                ))
            }
        }
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.transport.release_exchange(self.stream_id);
    }
}

/// The standalone server-push leg of a session.
pub struct Standalone {
    transport: Arc<StreamTransport>,
    stream_id: u64,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Standalone {
    pub async fn next(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

impl Drop for Standalone {
    fn drop(&mut self) {
        self.transport.release_standalone(self.stream_id);
    }
}

/// Decode a POST body: one message or a non-empty batch. The flag reports
/// whether it was a batch.
pub(crate) fn parse_body(body: &str) -> Result<(Vec<Envelope>, bool), Malformed> {
    let value: Value = serde_json::from_str(body).map_err(|e| Malformed::Parse(e.to_string()))?;
    let decode = |v: Value| Envelope::from_value(v).map_err(|e| Malformed::Invalid(e.to_string()));
    match value {
        Value::Array(items) if items.is_empty() => Err(Malformed::Invalid("empty batch".to_string())),
        Value::Array(items) => Ok((items.into_iter().map(decode).collect::<Result<_, _>>()?, true)),
        other => Ok((vec![decode(other)?], false)),
    }
}

fn with_session(mut response: Response, session_id: Option<&str>) -> Response {
    if let Some(value) = session_id.and_then(|id| HeaderValue::from_str(id).ok()) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

/// Answer a POST. `lease` is held until the reply is complete, or until
/// the client goes away.
pub(crate) async fn respond<L>(
    exchange: Option<Exchange>,
    batch: bool,
    event_stream: bool,
    session_id: Option<&str>,
    lease: L,
) -> Response
where
    L: Send + 'static,
{
    let Some(mut exchange) = exchange else {
        drop(lease);
        return with_session(StatusCode::ACCEPTED.into_response(), session_id);
    };

    if event_stream {
        let events = stream::unfold((exchange, lease), |(mut exchange, lease)| async move {
            let envelope = exchange.next().await?;
            Some((EventResult::Ok(message_event(&envelope)), (exchange, lease)))
        });
        let response = Sse::new(events).keep_alive(KeepAlive::default()).into_response();
        return with_session(response, session_id);
    }

    let mut responses = Vec::new();
    while let Some(envelope) = exchange.next().await {
        if envelope.is_response() {
            responses.push(envelope.to_value());
        }
    }
    drop(lease);
    let body = if batch {
        Value::Array(responses)
    } else {
        responses.into_iter().next().unwrap_or(Value::Null)
    };
    let response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response();
    with_session(response, session_id)
}

/// An SSE response over the standalone stream.
pub(crate) fn standalone_response<L>(standalone: Standalone, session_id: &str, lease: L) -> Response
where
    L: Send + 'static,
{
    let events = stream::unfold((standalone, lease), |(mut standalone, lease)| async move {
        let envelope = standalone.next().await?;
        Some((EventResult::Ok(message_event(&envelope)), (standalone, lease)))
    });
    with_session(
        Sse::new(events).keep_alive(KeepAlive::default()).into_response(),
        Some(session_id),
    )
}
