//! `text/event-stream` bodies from remote servers.
//!
//! Parsing is done by `eventsource-stream` over the raw byte stream; this
//! module only normalizes the events and maps failures into
//! [`GatewayError`].

use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::{Stream, StreamExt};

use crate::error::GatewayError;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type; `message` when the stream did not name one.
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

impl From<Event> for SseEvent {
    fn from(event: Event) -> Self {
        let name = if event.event.is_empty() {
            "message".to_string()
        } else {
            event.event
        };
        Self {
            event: name,
            data: event.data,
            id: Some(event.id).filter(|id| !id.is_empty()),
        }
    }
}

/// Feed a response body through the event parser until it ends. An event
/// still missing its terminating blank line at end of stream is discarded.
///
/// # Errors
///
/// The transport error that cut the body short, or
/// [`GatewayError::Remote`] when the body is not a valid event stream.
pub(crate) async fn read_event_stream<S, B, F>(body: S, mut on_event: F) -> Result<(), GatewayError>
where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
    F: FnMut(SseEvent),
{
    let mut events = body.eventsource();
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => on_event(event.into()),
            Err(EventStreamError::Transport(e)) => return Err(e.into()),
            Err(e) => return Err(GatewayError::remote(format!("malformed event stream: {e}"))),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(chunks: Vec<&'static [u8]>) -> Vec<SseEvent> {
        let body = futures::stream::iter(chunks.into_iter().map(Ok::<_, reqwest::Error>));
        let mut events = Vec::new();
        read_event_stream(body, |event| events.push(event)).await.unwrap();
        events
    }

    #[tokio::test]
    async fn decodes_named_and_default_events() {
        let events = collect(vec![
            b"event: endpoint\ndata: /message?sessionId=abc\n\n: keep-alive\n\ndata: {\"a\":1}\r\n\r\n",
        ])
        .await;
        assert_eq!(
            events,
            vec![
                SseEvent {
                    event: "endpoint".into(),
                    data: "/message?sessionId=abc".into(),
                    id: None,
                },
                SseEvent {
                    event: "message".into(),
                    data: "{\"a\":1}".into(),
                    id: None,
                },
            ]
        );
    }

    #[tokio::test]
    async fn events_split_across_chunks_are_reassembled() {
        let events = collect(vec![
            b"id: 7\nevent: mes",
            b"sage\ndata: first",
            b" line\ndata: second line\n",
            b"\n",
        ])
        .await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "first line\nsecond line");
        assert_eq!(events[0].id.as_deref(), Some("7"));
    }
}
