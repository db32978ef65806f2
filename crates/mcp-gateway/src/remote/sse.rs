//! Remote endpoint speaking the SSE transport: one long-lived GET carries
//! everything inbound; each outbound message is a POST to the endpoint the
//! stream announced.

use async_trait::async_trait;
use mcp_gateway_core::Envelope;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{Instrument, debug, info, warn};
use url::Url;

use super::{InboundTx, RemoteEndpoint, forward, read_event_stream, remote_failure};
use crate::error::GatewayError;

pub struct SseRemote {
    client: reqwest::Client,
    headers: HeaderMap,
    endpoint: Url,
    reader: AbortHandle,
    span: tracing::Span,
}

impl SseRemote {
    /// Open the event stream and wait for its `endpoint` event.
    ///
    /// # Errors
    ///
    /// Invalid URL, connection failure, a non-success status, or the stream
    /// ending before announcing an endpoint.
    pub async fn connect(url: &str, headers: HeaderMap, inbound: InboundTx) -> Result<Self, GatewayError> {
        let url = Url::parse(url).map_err(|e| GatewayError::Config(format!("invalid SSE URL {url}: {e}")))?;
        let span = tracing::info_span!("remote", transport = "sse", %url);
        let client = reqwest::Client::new();
        let response = client
            .get(url.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(remote_failure(status, &body));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let body = Box::pin(response.bytes_stream());
        let reader = tokio::spawn(
            async move {
                let mut endpoint_tx = Some(endpoint_tx);
                let result = read_event_stream(body, |event| match event.event.as_str() {
                    "endpoint" => {
                        if let Some(tx) = endpoint_tx.take() {
                            let _ = tx.send(event.data);
                        }
                    }
                    "message" => {
                        forward(&inbound, &event.data);
                    }
                    other => debug!(event = other, "ignoring SSE event"),
                })
                .await;
                match result {
                    Ok(()) => warn!("remote event stream ended"),
                    Err(e) => warn!(error = %e, "remote event stream failed"),
                }
            }
            .instrument(span.clone()),
        )
        .abort_handle();

        let announced = endpoint_rx.await.map_err(|_| GatewayError::RemoteClosed)?;
        let endpoint = url
            .join(announced.trim())
            .map_err(|e| GatewayError::remote(format!("invalid endpoint {announced}: {e}")))?;
        span.in_scope(|| info!(%endpoint, "connected to remote SSE endpoint"));
        Ok(Self {
            client,
            headers,
            endpoint,
            reader,
            span,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl RemoteEndpoint for SseRemote {
    async fn send(&self, envelope: Envelope) -> Result<(), GatewayError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(envelope.to_line())
            .send()
            .instrument(self.span.clone())
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(remote_failure(status, &body))
    }

    async fn shutdown(&self) {
        self.reader.abort();
    }
}
