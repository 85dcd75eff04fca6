//! SSE wire framing for session events.

use std::fmt::Write as _;

use agent_events_core::{EventError, SessionEvent};

/// Request header carrying the client's reconnect checkpoint.
pub const LAST_EVENT_ID: &str = "last-event-id";

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid Last-Event-ID: {0:?}")]
    InvalidLastEventId(String),
}

/// One SSE message.
///
/// `id` is only set for events that hold a log position, so a browser's
/// `EventSource` never resumes from a heartbeat or an error notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub id: Option<i64>,
    pub event: String,
    pub data: String,
}

impl SseFrame {
    /// Frame a session event; `data` carries the full JSON envelope.
    ///
    /// # Errors
    /// Returns error if the event cannot be serialized.
    pub fn from_event(event: &SessionEvent) -> Result<Self, EventError> {
        Ok(Self {
            id: event.is_sequenced().then_some(event.sequence),
            event: event.event_type().to_string(),
            data: event.to_json()?,
        })
    }

    /// Encode as `text/event-stream` text, terminated by a blank line.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = String::new();
        if let Some(id) = self.id {
            let _ = writeln!(out, "id: {id}");
        }
        let _ = writeln!(out, "event: {}", self.event);
        for line in self.data.lines() {
            let _ = writeln!(out, "data: {line}");
        }
        out.push('\n');
        out
    }
}

/// Parse a `Last-Event-ID` header value.
///
/// A missing or blank header means a fresh connection.
///
/// # Errors
/// Returns error if the value is not a non-negative sequence number.
pub fn parse_last_event_id(value: Option<&str>) -> Result<Option<i64>, ProtocolError> {
    let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    match raw.parse::<i64>() {
        Ok(sequence) if sequence >= 0 => Ok(Some(sequence)),
        _ => Err(ProtocolError::InvalidLastEventId(raw.to_string())),
    }
}
