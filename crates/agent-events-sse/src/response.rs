//! Axum SSE responses (requires `axum` feature).

use std::convert::Infallible;

use agent_events_core::{EventError, SessionEvent};
use axum::{
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt, future};
use tracing::warn;

use crate::{
    delivery::DeliveryStream,
    protocol::{LAST_EVENT_ID, ProtocolError, parse_last_event_id},
};

/// Convert a session event into an axum SSE event.
///
/// # Errors
/// Returns error if the event cannot be serialized.
pub fn to_axum_event(event: &SessionEvent) -> Result<Event, EventError> {
    let sse = Event::default()
        .event(event.event_type())
        .data(event.to_json()?);
    Ok(if event.is_sequenced() {
        sse.id(event.sequence.to_string())
    } else {
        sse
    })
}

/// Reconnect checkpoint from the request's `Last-Event-ID` header.
///
/// # Errors
/// Returns error if the header is present but not a sequence number.
pub fn last_event_id(headers: &HeaderMap) -> Result<Option<i64>, ProtocolError> {
    parse_last_event_id(headers.get(LAST_EVENT_ID).and_then(|v| v.to_str().ok()))
}

/// Wrap a delivery stream as an SSE response body.
#[must_use]
pub fn into_sse(
    stream: DeliveryStream,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    let events = stream.filter_map(|event| {
        future::ready(match to_axum_event(&event) {
            Ok(sse) => Some(Ok(sse)),
            Err(e) => {
                warn!(
                    session_id = %event.session_id,
                    sequence = event.sequence,
                    "Dropping unserializable event: {e}"
                );
                None
            }
        })
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}
