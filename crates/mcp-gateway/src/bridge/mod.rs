//! Transport bridges.
//!
//! Server-side bridges expose a stdio child over HTTP:
//! [`sse`] (one pooled child per event stream), [`ws`] (one shared child,
//! many sockets) and [`streamable`] (stateful sessions or one child per
//! request). [`client`] runs the other way, presenting a remote endpoint on
//! the gateway's own stdio.

pub mod client;
pub mod sse;
pub mod streamable;
pub mod ws;

use std::convert::Infallible;

use axum::http::StatusCode;
use axum::response::Response;
use axum::response::sse::Event;
use mcp_gateway_core::{Envelope, ErrorCode};

use crate::http::rpc_error;

pub(crate) type EventResult = Result<Event, Infallible>;

/// An SSE `message` event carrying one envelope.
pub(crate) fn message_event(envelope: &Envelope) -> Event {
    Event::default().event("message").data(envelope.to_line())
}

/// Why a client body could not be used.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Malformed {
    /// Not JSON at all.
    Parse(String),
    /// JSON, but not a JSON-RPC message.
    Invalid(String),
}

impl Malformed {
    pub(crate) fn into_response(self) -> Response {
        match self {
            Self::Parse(reason) => rpc_error(
                StatusCode::BAD_REQUEST,
                ErrorCode::ParseError,
                &format!("Parse error: {reason}"),
            ),
            Self::Invalid(reason) => rpc_error(
                StatusCode::BAD_REQUEST,
                ErrorCode::InvalidRequest,
                &format!("Invalid Request: {reason}"),
            ),
        }
    }
}

pub(crate) fn parse_envelope(text: &str) -> Result<Envelope, Malformed> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| Malformed::Parse(e.to_string()))?;
    Envelope::from_value(value).map_err(|e| Malformed::Invalid(e.to_string()))
}

/// Normalize a route prefix to `""` or `/segment` form.
pub(crate) fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}
