//! Remote endpoint speaking Streamable HTTP.
//!
//! Every outbound envelope is its own POST. `send` returns as soon as the
//! response headers arrive; the reply body, a JSON document or an event
//! stream, is read in the background. A server that streams its reply lets
//! the next message go out while a tool is still running, while one that
//! withholds its headers until the tool finishes holds the sender until
//! then. Once the session is initialized a GET push stream is opened for
//! server-initiated traffic.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use mcp_gateway_core::envelope::INITIALIZED_METHOD;
use mcp_gateway_core::{Envelope, RequestId};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap};
use reqwest::{Response, StatusCode};
use tokio::task::AbortHandle;
use tracing::{Instrument, debug, info, warn};
use url::Url;

use super::{InboundTx, RemoteEndpoint, forward, read_event_stream, remote_failure};
use crate::error::GatewayError;
use crate::http::SESSION_HEADER;

const ACCEPT_BOTH: &str = "application/json, text/event-stream";

pub struct StreamableRemote {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    inbound: InboundTx,
    session: Mutex<Option<String>>,
    tasks: Mutex<Vec<AbortHandle>>,
    span: tracing::Span,
}

impl StreamableRemote {
    /// No request is made until the first [`RemoteEndpoint::send`].
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] for an unparsable URL.
    pub fn new(url: &str, headers: HeaderMap, inbound: InboundTx) -> Result<Self, GatewayError> {
        let url = Url::parse(url).map_err(|e| GatewayError::Config(format!("invalid Streamable HTTP URL {url}: {e}")))?;
        let span = tracing::info_span!("remote", transport = "streamable-http", %url);
        Ok(Self {
            client: reqwest::Client::new(),
            url,
            headers,
            inbound,
            session: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            span,
        })
    }

    /// Session id assigned by the remote, once one has been seen.
    pub fn session_id(&self) -> Option<String> {
        self.session().clone()
    }

    fn session(&self) -> MutexGuard<'_, Option<String>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, handle: AbortHandle) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    fn request_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        if let Some(id) = self.session().as_deref() {
            match id.parse() {
                Ok(value) => {
                    headers.insert(SESSION_HEADER, value);
                }
                Err(_) => warn!(session = id, "remote session id is not a valid header value"),
            }
        }
        headers
    }

    fn remember_session(&self, response: &Response) {
        let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
        else {
            return;
        };
        let mut session = self.session();
        if session.as_deref() != Some(id) {
            self.span.in_scope(|| info!(session = id, "remote session established"));
            *session = Some(id.to_string());
        }
    }

    fn open_push_stream(&self) {
        let request = self
            .client
            .get(self.url.clone())
            .headers(self.request_headers())
            .header(ACCEPT, "text/event-stream");
        let inbound = self.inbound.clone();
        let task = tokio::spawn(
            async move {
                let response = match request.send().await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(error = %e, "could not open remote push stream");
                        return;
                    }
                };
                match response.status() {
                    StatusCode::METHOD_NOT_ALLOWED => {
                        info!("remote does not offer a push stream");
                        return;
                    }
                    status if !status.is_success() => {
                        warn!(%status, "remote refused the push stream");
                        return;
                    }
                    _ => {}
                }
                debug!("remote push stream open");
                let body = Box::pin(response.bytes_stream());
                let result = read_event_stream(body, |event| {
                    forward(&inbound, &event.data);
                })
                .await;
                match result {
                    Ok(()) => info!("remote push stream ended"),
                    Err(e) => warn!(error = %e, "remote push stream failed"),
                }
            }
            .instrument(self.span.clone()),
        );
        self.track(task.abort_handle());
    }
}

/// Forward every envelope in a POST reply. Returns whether `id` was answered.
async fn read_reply(response: Response, inbound: &InboundTx, id: &RequestId) -> Result<bool, GatewayError> {
    let mut answered = false;
    let mut deliver = |text: &str| {
        if let Some(envelope) = forward(inbound, text) {
            if envelope.is_response() && envelope.id() == Some(id) {
                answered = true;
            }
        }
    };

    let event_stream = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"));
    if event_stream {
        let body = Box::pin(response.bytes_stream());
        read_event_stream(body, |event| deliver(&event.data)).await?;
    } else {
        let text = response.text().await?;
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(serde_json::Value::Array(items)) => {
                for item in items {
                    deliver(&item.to_string());
                }
            }
            Ok(_) => deliver(&text),
            Err(_) if text.trim().is_empty() => {}
            Err(_) => deliver(&text),
        }
    }
    Ok(answered)
}

#[async_trait]
impl RemoteEndpoint for StreamableRemote {
    async fn send(&self, envelope: Envelope) -> Result<(), GatewayError> {
        let response = self
            .client
            .post(self.url.clone())
            .headers(self.request_headers())
            .header(ACCEPT, ACCEPT_BOTH)
            .header(CONTENT_TYPE, "application/json")
            .body(envelope.to_line())
            .send()
            .instrument(self.span.clone())
            .await?;
        self.remember_session(&response);

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(remote_failure(status, &body));
        }
        if envelope.method() == Some(INITIALIZED_METHOD) {
            self.open_push_stream();
        }

        let Some(id) = envelope.id().filter(|_| envelope.is_request()).cloned() else {
            return Ok(());
        };
        if status == StatusCode::ACCEPTED {
            return Ok(());
        }
        let inbound = self.inbound.clone();
        let task = tokio::spawn(
            async move {
                let answered = match read_reply(response, &inbound, &id).await {
                    Ok(answered) => answered,
                    Err(e) => {
                        warn!(error = %e, "remote reply stream failed");
                        false
                    }
                };
                if !answered {
                    let _ = inbound.send(Envelope::error_response(
                        id,
                        mcp_gateway_core::ErrorCode::ServerError,
                        "Remote stream ended before a response arrived",
                    ));
                }
            }
            .instrument(self.span.clone()),
        );
        self.track(task.abort_handle());
        Ok(())
    }

    async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        if self.session().is_none() {
            return;
        }
        let result = self
            .client
            .delete(self.url.clone())
            .headers(self.request_headers())
            .send()
            .await;
        self.span.in_scope(|| match result {
            Ok(response) => debug!(status = %response.status(), "remote session closed"),
            Err(e) => warn!(error = %e, "could not close remote session"),
        });
    }
}
