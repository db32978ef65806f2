//! Clients for remote MCP endpoints, used by the client-mode bridge.
//!
//! A [`RemoteEndpoint`] accepts outbound envelopes; everything the remote
//! sends back (responses, notifications, server requests) arrives on the
//! inbound channel handed over at connect time. The channel closing means
//! the remote went away.

pub mod sse;
pub mod sse_codec;
pub mod streamable;

use async_trait::async_trait;
use mcp_gateway_core::Envelope;
use mcp_gateway_core::envelope::strip_mcp_error_prefix;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::GatewayError;
pub(crate) use sse_codec::read_event_stream;

pub use sse::SseRemote;
pub use streamable::StreamableRemote;

/// Where inbound envelopes are delivered.
pub type InboundTx = mpsc::UnboundedSender<Envelope>;

#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    /// Deliver one envelope to the remote. Replies arrive on the inbound
    /// channel.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Remote`] when the remote rejects the message, or a
    /// transport error.
    async fn send(&self, envelope: Envelope) -> Result<(), GatewayError>;

    /// End the remote session, if the transport has one.
    async fn shutdown(&self);
}

/// Turn configured header pairs into a request header map.
pub fn header_map(headers: &[(HeaderName, HeaderValue)]) -> HeaderMap {
    headers.iter().cloned().collect()
}

/// Decode one envelope from event or body text.
pub(crate) fn decode_envelope(text: &str) -> Result<Envelope, String> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    Envelope::from_value(value).map_err(|e| e.to_string())
}

/// Forward the envelope carried by an event or body, logging garbage.
pub(crate) fn forward(inbound: &InboundTx, text: &str) -> Option<Envelope> {
    match decode_envelope(text) {
        Ok(envelope) => {
            let _ = inbound.send(envelope.clone());
            Some(envelope)
        }
        Err(e) => {
            let raw: String = text.chars().take(200).collect();
            warn!(error = %e, %raw, "ignoring undecodable message from remote");
            None
        }
    }
}

/// Map a rejected HTTP exchange to an error, keeping the JSON-RPC code
/// when the body carries one.
pub(crate) fn remote_failure(status: StatusCode, body: &str) -> GatewayError {
    if let Ok(Envelope::Response { result: Err(error), .. }) = decode_envelope(body) {
        return GatewayError::Remote {
            code: Some(error.code),
            message: strip_mcp_error_prefix(error.code, &error.message),
        };
    }
    let body = body.trim();
    if body.is_empty() {
        GatewayError::remote(format!("HTTP {status}"))
    } else {
        GatewayError::remote(format!("HTTP {status}: {body}"))
    }
}
