//! Auto-handshake for peers that skip `initialize`.
//!
//! Some clients assume a fresh connection is already protocol-ready and send
//! `tools/call` straight away. [`Handshake`] sits between such a client and
//! the server: it holds the client's messages back, performs the
//! `initialize` / `notifications/initialized` exchange itself, swallows the
//! synthetic response, and then releases the held messages in order.
//!
//! The machine is pure: callers feed it messages and act on what it returns.

use mcp_gateway_core::envelope::{auto_initialize_id, initialize_request, initialized_notification};
use mcp_gateway_core::{Envelope, RequestId};

/// Client name announced in gateway-originated `initialize` requests.
pub const CLIENT_NAME: &str = "mcp-gateway";

#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeState {
    Uninitialized,
    /// The gateway sent `initialize` on the client's behalf and is holding
    /// the client's messages until it is answered.
    AutoInitializing {
        init_id: RequestId,
        deferred: Vec<Envelope>,
    },
    /// The client sent its own `initialize`.
    ClientInitializing { init_id: RequestId },
    Initialized,
}

/// What to do with a message coming back from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Pass it on to the client.
    Forward(Envelope),
    /// Drop it, and write these messages to the server instead.
    Swallow { then_send: Vec<Envelope> },
}

#[derive(Debug, Clone)]
pub struct Handshake {
    state: HandshakeState,
    protocol_version: String,
}

impl Handshake {
    pub fn new(protocol_version: impl Into<String>) -> Self {
        Self {
            state: HandshakeState::Uninitialized,
            protocol_version: protocol_version.into(),
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.state == HandshakeState::Initialized
    }

    /// Feed a client message; returns what to send to the server now.
    pub fn outbound(&mut self, message: Envelope) -> Vec<Envelope> {
        match &mut self.state {
            HandshakeState::Uninitialized => {
                if let Some(id) = message.id().filter(|_| message.is_initialize_request()) {
                    self.state = HandshakeState::ClientInitializing { init_id: id.clone() };
                    return vec![message];
                }
                let init_id = auto_initialize_id();
                tracing::info!(
                    init_id = %init_id,
                    method = ?message.method(),
                    "client skipped initialize; initializing on its behalf"
                );
                let init = initialize_request(init_id.clone(), &self.protocol_version, CLIENT_NAME);
                self.state = HandshakeState::AutoInitializing {
                    init_id,
                    deferred: vec![message],
                };
                vec![init]
            }
            HandshakeState::AutoInitializing { deferred, .. } => {
                deferred.push(message);
                Vec::new()
            }
            HandshakeState::ClientInitializing { .. } | HandshakeState::Initialized => vec![message],
        }
    }

    /// Feed a server message; returns whether the client should see it.
    pub fn inbound(&mut self, message: Envelope) -> Inbound {
        let answers = |init_id: &RequestId| {
            matches!(&message, Envelope::Response { id, .. } if id == init_id)
        };
        match &self.state {
            HandshakeState::AutoInitializing { init_id, .. } if answers(init_id) => {
                let HandshakeState::AutoInitializing { deferred, .. } =
                    std::mem::replace(&mut self.state, HandshakeState::Initialized)
                else {
                    return Inbound::Forward(message);
                };
                if let Envelope::Response { result: Err(e), .. } = &message {
                    tracing::warn!(code = e.code, message = %e.message, "automatic initialize was rejected");
                }
                let mut then_send = Vec::with_capacity(deferred.len() + 1);
                then_send.push(initialized_notification());
                then_send.extend(deferred);
                Inbound::Swallow { then_send }
            }
            HandshakeState::ClientInitializing { init_id } if answers(init_id) => {
                self.state = HandshakeState::Initialized;
                Inbound::Forward(message)
            }
            _ => Inbound::Forward(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(id: i64) -> Envelope {
        Envelope::request(id, "tools/call", Some(json!({"name":"add","arguments":{"a":1,"b":2}})))
    }

    #[test]
    fn skipped_initialize_is_performed_transparently() {
        let mut hs = Handshake::new("2024-11-05");
        let sent = hs.outbound(call(1));
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_initialize_request());
        let init_id = sent[0].id().cloned().unwrap();
        assert!(init_id.to_string().starts_with("init_"));
        assert_eq!(sent[0].to_value()["params"]["protocolVersion"], "2024-11-05");

        // Held back while the handshake is in flight.
        assert!(hs.outbound(call(2)).is_empty());

        let reply = Envelope::success(init_id, json!({"protocolVersion":"2024-11-05"}));
        match hs.inbound(reply) {
            Inbound::Swallow { then_send } => {
                assert_eq!(then_send.len(), 3);
                assert_eq!(then_send[0].method(), Some("notifications/initialized"));
                assert_eq!(then_send[1], call(1));
                assert_eq!(then_send[2], call(2));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(hs.is_initialized());

        let answer = Envelope::success(1.into(), json!({"content":[]}));
        assert_eq!(hs.inbound(answer.clone()), Inbound::Forward(answer));
        assert_eq!(hs.outbound(call(3)), vec![call(3)]);
    }

    #[test]
    fn client_initialize_passes_through() {
        let mut hs = Handshake::new("2024-11-05");
        let init = initialize_request(7.into(), "2025-03-26", "client");
        assert_eq!(hs.outbound(init.clone()), vec![init]);
        assert!(matches!(hs.state(), HandshakeState::ClientInitializing { .. }));

        // The client owns the handshake; other traffic is not held.
        let note = Envelope::notification("notifications/initialized", None);
        assert_eq!(hs.outbound(note.clone()), vec![note]);

        let reply = Envelope::success(7.into(), json!({}));
        assert_eq!(hs.inbound(reply.clone()), Inbound::Forward(reply));
        assert!(hs.is_initialized());
    }

    #[test]
    fn unrelated_responses_are_forwarded_during_auto_init() {
        let mut hs = Handshake::new("2024-11-05");
        hs.outbound(call(1));
        let log = Envelope::notification("notifications/message", Some(json!({"level":"info"})));
        assert_eq!(hs.inbound(log.clone()), Inbound::Forward(log));
        assert!(matches!(hs.state(), HandshakeState::AutoInitializing { .. }));
    }

    #[test]
    fn rejected_auto_initialize_still_releases_messages() {
        let mut hs = Handshake::new("2024-11-05");
        let init_id = hs.outbound(call(1))[0].id().cloned().unwrap();
        let reply = Envelope::error_response(init_id, -32602, "unsupported version");
        match hs.inbound(reply) {
            Inbound::Swallow { then_send } => assert_eq!(then_send.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }
}
