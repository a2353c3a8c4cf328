//! Rendering of [`StreamEvent`]/[`SseMessage`] into axum SSE frames, each
//! carrying the Streaming Core's own `id`/`event`/`data` envelope rather than
//! a bare `data:` line.

use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::{Stream, StreamExt};

use crate::emitter::SseMessage;
use crate::events::StreamEvent;

pub fn event_to_sse(event: &StreamEvent) -> Event {
    Event::default()
        .id(event.sequence.to_string())
        .event(event.event_type().as_str())
        .data(event.to_wire_payload().to_string())
}

fn message_to_sse(message: SseMessage) -> Event {
    match message {
        SseMessage::Event(event) => event_to_sse(&event),
        SseMessage::Heartbeat { comment } => Event::default().comment(comment),
    }
}

/// Adapt a stream of [`SseMessage`] into the `Sse` response axum serves.
pub fn sse_response<S>(messages: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = SseMessage>,
{
    Sse::new(messages.map(|msg| Ok(message_to_sse(msg)))).keep_alive(KeepAlive::default())
}
