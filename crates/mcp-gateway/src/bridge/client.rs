//! Remote → stdio.
//!
//! Presents a remote SSE or Streamable HTTP endpoint on the gateway's own
//! stdin/stdout. The same auto-handshake used by the stateless bridge runs
//! toward the remote, so a local client that never sends `initialize` still
//! gets a working session.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use mcp_gateway_core::envelope::strip_mcp_error_prefix;
use mcp_gateway_core::{Envelope, ErrorCode, LocalReader, RequestId, write_newline_delimited};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Malformed, parse_envelope};
use crate::error::GatewayError;
use crate::handshake::{Handshake, Inbound};
use crate::remote::RemoteEndpoint;

struct ClientBridge<W> {
    remote: Arc<dyn RemoteEndpoint>,
    handshake: Handshake,
    output: W,
}

/// Pump messages between the local stdio pair and `remote` until the local
/// side reaches EOF (clean exit) or the remote goes away (error).
///
/// # Errors
///
/// [`GatewayError::RemoteClosed`] when the inbound channel closes, or an
/// I/O error on the local side.
pub async fn run<R, W>(
    remote: Arc<dyn RemoteEndpoint>,
    mut inbound: mpsc::UnboundedReceiver<Envelope>,
    input: R,
    output: W,
    protocol_version: &str,
) -> Result<(), GatewayError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    // Reading happens on its own task: a line read is not safe to cancel
    // mid-way inside `select!`.
    let (local_tx, mut local) = mpsc::channel::<io::Result<String>>(64);
    let reader = tokio::spawn(async move {
        let mut reader = LocalReader::new(input);
        loop {
            let item = match reader.next_message().await {
                Ok(Some(raw)) => Ok(raw),
                Ok(None) => break,
                Err(e) => Err(e),
            };
            let failed = item.is_err();
            if local_tx.send(item).await.is_err() || failed {
                break;
            }
        }
    });
    let _reader = AbortOnDrop(reader);

    let mut bridge = ClientBridge {
        remote,
        handshake: Handshake::new(protocol_version),
        output,
    };
    loop {
        tokio::select! {
            raw = local.recv() => {
                let Some(raw) = raw else {
                    info!("local input closed; ending remote session");
                    bridge.remote.shutdown().await;
                    return Ok(());
                };
                bridge.from_local(&raw?).await?;
            }
            message = inbound.recv() => {
                let Some(message) = message else {
                    warn!("remote connection closed");
                    bridge.remote.shutdown().await;
                    return Err(GatewayError::RemoteClosed);
                };
                bridge.from_remote(message).await?;
            }
        }
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<W: AsyncWrite + Unpin> ClientBridge<W> {
    async fn write(&mut self, envelope: &Envelope) -> Result<(), GatewayError> {
        write_newline_delimited(&mut self.output, &envelope.to_line()).await?;
        Ok(())
    }

    async fn from_local(&mut self, raw: &str) -> Result<(), GatewayError> {
        let message = match parse_envelope(raw) {
            Ok(message) => message,
            Err(malformed) => {
                let (code, text) = match malformed {
                    Malformed::Parse(reason) => (ErrorCode::ParseError, format!("Parse error: {reason}")),
                    Malformed::Invalid(reason) => (ErrorCode::InvalidRequest, format!("Invalid Request: {reason}")),
                };
                warn!(error = %text, "rejecting local message");
                return self
                    .write(&Envelope::error_response(RequestId::Null, code, text))
                    .await;
            }
        };
        debug!(method = ?message.method(), id = ?message.id(), "local -> remote");
        let outbound = self.handshake.outbound(message);
        self.send_all(outbound).await
    }

    /// Send in order. A request the remote refuses is answered locally with
    /// an error; when that request was the synthetic `initialize`, the
    /// messages it held back are released.
    async fn send_all(&mut self, messages: Vec<Envelope>) -> Result<(), GatewayError> {
        let mut queue = VecDeque::from(messages);
        while let Some(message) = queue.pop_front() {
            let request_id = message.id().filter(|_| message.is_request()).cloned();
            let Err(e) = self.remote.send(message).await else {
                continue;
            };
            warn!(error = %e, "remote rejected message");
            let Some(id) = request_id else {
                continue;
            };
            let code = e.rpc_code();
            let reply = Envelope::error_response(id, code, strip_mcp_error_prefix(code, &e.to_string()));
            match self.handshake.inbound(reply) {
                Inbound::Forward(reply) => self.write(&reply).await?,
                Inbound::Swallow { then_send } => {
                    for next in then_send.into_iter().rev() {
                        queue.push_front(next);
                    }
                }
            }
        }
        Ok(())
    }

    async fn from_remote(&mut self, message: Envelope) -> Result<(), GatewayError> {
        match self.handshake.inbound(message) {
            Inbound::Forward(message) => {
                debug!(method = ?message.method(), id = ?message.id(), "remote -> local");
                self.write(&without_error_prefix(message)).await
            }
            Inbound::Swallow { then_send } => self.send_all(then_send).await,
        }
    }
}

fn without_error_prefix(mut message: Envelope) -> Envelope {
    if let Envelope::Response { result: Err(error), .. } = &mut message {
        error.message = strip_mcp_error_prefix(error.code, &error.message);
    }
    message
}
