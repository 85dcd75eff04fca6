//! Session event envelope and the known event kinds.
//!
//! On the wire every event is the same JSON envelope:
//! `{"type", "data", "session_id", "sequence", "timestamp"}`.
//! In memory the `type`/`data` pair is a tagged [`EventKind`], with an
//! opaque [`EventKind::Custom`] fallback for dynamic tool output.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use thiserror::Error;

/// Sequence carried by events that never went through the durable log
/// (heartbeats, infrastructure errors, gap markers).
pub const UNSEQUENCED: i64 = -1;

/// Event types that end a session's live stream.
pub const TERMINAL_EVENT_TYPES: [&str; 3] = ["agent_complete", "error", "cancelled"];

/// Returns true if `event_type` ends a session's live stream.
#[must_use]
pub fn is_terminal_type(event_type: &str) -> bool {
    TERMINAL_EVENT_TYPES.contains(&event_type)
}

/// Convert any serializable value into JSON, falling back to its debug
/// representation when serialization fails (e.g. maps with non-string keys).
pub fn to_json_safe<T>(value: &T) -> Value
where
    T: Serialize + fmt::Debug + ?Sized,
{
    serde_json::to_value(value).unwrap_or_else(|_| Value::String(format!("{value:?}")))
}

/// Event encoding error.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("Failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Failed to decode event: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Agent status transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A tool invocation started by the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Output of a finished tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: String,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Alert raised by the command filter or sensitive-data scanner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityAlert {
    pub severity: String,
    pub message: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The agent finished its task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentComplete {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The session failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionError {
    pub message: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The session was cancelled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cancelled {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Idle keepalive synthesized by a listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub session_id: String,
    pub server_time: DateTime<Utc>,
    /// Last sequence the listener has read for this subscriber.
    pub stream_position: i64,
}

/// Delivery-path failure surfaced to live subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfrastructureError {
    pub error_type: String,
    pub message: String,
    pub recoverable: bool,
}

/// Marker for records lost to retention between a checkpoint and the
/// earliest retained record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamGap {
    pub requested_after: i64,
    pub resumed_at: i64,
}

/// Kind-specific event payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    StatusChange(StatusChange),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    SecurityAlert(SecurityAlert),
    AgentComplete(AgentComplete),
    Error(SessionError),
    Cancelled(Cancelled),
    Heartbeat(Heartbeat),
    InfrastructureError(InfrastructureError),
    StreamGap(StreamGap),
    /// Any other event type, or a known type whose payload does not fit its struct.
    Custom {
        event_type: String,
        data: Map<String, Value>,
    },
}

impl EventKind {
    /// Create a custom event from an arbitrary payload.
    ///
    /// Objects become the event data as-is; any other value is stored under
    /// `"value"`. Payloads that cannot be serialized are coerced to a string.
    pub fn custom<T>(event_type: impl Into<String>, payload: &T) -> Self
    where
        T: Serialize + fmt::Debug + ?Sized,
    {
        let data = match to_json_safe(payload) {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self::Custom {
            event_type: event_type.into(),
            data,
        }
    }

    /// Like [`EventKind::custom`], but known types decode to their typed variant.
    pub fn from_payload<T>(event_type: impl Into<String>, payload: &T) -> Self
    where
        T: Serialize + fmt::Debug + ?Sized,
    {
        match Self::custom(event_type, payload) {
            Self::Custom { event_type, data } => Self::from_parts(event_type, data),
            typed => typed,
        }
    }

    /// Rebuild a kind from its wire `type` and `data`.
    #[must_use]
    pub fn from_parts(event_type: String, data: Map<String, Value>) -> Self {
        let decoded = match event_type.as_str() {
            "status_change" => typed(&data).map(Self::StatusChange),
            "tool_call" => typed(&data).map(Self::ToolCall),
            "tool_result" => typed(&data).map(Self::ToolResult),
            "security_alert" => typed(&data).map(Self::SecurityAlert),
            "agent_complete" => typed(&data).map(Self::AgentComplete),
            "error" => typed(&data).map(Self::Error),
            "cancelled" => typed(&data).map(Self::Cancelled),
            "heartbeat" => typed(&data).map(Self::Heartbeat),
            "infrastructure_error" => typed(&data).map(Self::InfrastructureError),
            "stream_gap" => typed(&data).map(Self::StreamGap),
            _ => None,
        };
        decoded.unwrap_or(Self::Custom { event_type, data })
    }

    /// Wire `type` of this event.
    #[must_use]
    pub fn event_type(&self) -> &str {
        match self {
            Self::StatusChange(_) => "status_change",
            Self::ToolCall(_) => "tool_call",
            Self::ToolResult(_) => "tool_result",
            Self::SecurityAlert(_) => "security_alert",
            Self::AgentComplete(_) => "agent_complete",
            Self::Error(_) => "error",
            Self::Cancelled(_) => "cancelled",
            Self::Heartbeat(_) => "heartbeat",
            Self::InfrastructureError(_) => "infrastructure_error",
            Self::StreamGap(_) => "stream_gap",
            Self::Custom { event_type, .. } => event_type,
        }
    }

    /// Wire `data` of this event.
    #[must_use]
    pub fn data(&self) -> Map<String, Value> {
        match self {
            Self::StatusChange(p) => object(p),
            Self::ToolCall(p) => object(p),
            Self::ToolResult(p) => object(p),
            Self::SecurityAlert(p) => object(p),
            Self::AgentComplete(p) => object(p),
            Self::Error(p) => object(p),
            Self::Cancelled(p) => object(p),
            Self::Heartbeat(p) => object(p),
            Self::InfrastructureError(p) => object(p),
            Self::StreamGap(p) => object(p),
            Self::Custom { data, .. } => data.clone(),
        }
    }

    /// Returns true for `agent_complete`, `error` and `cancelled`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        is_terminal_type(self.event_type())
    }
}

fn typed<T: DeserializeOwned>(data: &Map<String, Value>) -> Option<T> {
    serde_json::from_value(Value::Object(data.clone())).ok()
}

fn object<T: Serialize + fmt::Debug>(payload: &T) -> Map<String, Value> {
    match to_json_safe(payload) {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// An event handed to the publisher.
///
/// Producers never choose the sequence or timestamp; both are assigned on publish.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub kind: EventKind,
    /// Forward to the secondary persistence sink.
    pub persist: bool,
}

impl NewEvent {
    /// Live-only event (not archived by the persistence sink).
    #[must_use]
    pub const fn new(kind: EventKind) -> Self {
        Self {
            kind,
            persist: false,
        }
    }

    /// Event that is also archived by the persistence sink.
    #[must_use]
    pub const fn persisted(kind: EventKind) -> Self {
        Self {
            kind,
            persist: true,
        }
    }
}

impl From<EventKind> for NewEvent {
    fn from(kind: EventKind) -> Self {
        Self::new(kind)
    }
}

/// An event in a session stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireEvent", into = "WireEvent")]
pub struct SessionEvent {
    pub session_id: String,
    /// Log-assigned position, or [`UNSEQUENCED`].
    pub sequence: i64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl SessionEvent {
    /// Create an unsequenced event stamped with the current time.
    #[must_use]
    pub fn new(session_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            session_id: session_id.into(),
            sequence: UNSEQUENCED,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Heartbeat for an idle stream.
    #[must_use]
    pub fn heartbeat(session_id: &str, stream_position: i64) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            sequence: UNSEQUENCED,
            timestamp: now,
            kind: EventKind::Heartbeat(Heartbeat {
                session_id: session_id.to_string(),
                server_time: now,
                stream_position,
            }),
        }
    }

    /// Recoverable delivery-path failure.
    #[must_use]
    pub fn infrastructure_error(
        session_id: &str,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            session_id,
            EventKind::InfrastructureError(InfrastructureError {
                error_type: error_type.into(),
                message: message.into(),
                recoverable: true,
            }),
        )
    }

    /// Retention gap marker.
    #[must_use]
    pub fn stream_gap(session_id: &str, requested_after: i64, resumed_at: i64) -> Self {
        Self::new(
            session_id,
            EventKind::StreamGap(StreamGap {
                requested_after,
                resumed_at,
            }),
        )
    }

    /// Wire `type` of this event.
    #[must_use]
    pub fn event_type(&self) -> &str {
        self.kind.event_type()
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }

    /// Returns true if the event holds a position in the session log.
    #[must_use]
    pub const fn is_sequenced(&self) -> bool {
        self.sequence > 0
    }

    /// Encode the log body: the envelope without `sequence`, which the log assigns.
    ///
    /// # Errors
    /// Returns error if the body cannot be serialized.
    pub fn encode_body(&self) -> Result<String, EventError> {
        let body = BodyRef {
            event_type: self.kind.event_type(),
            data: self.kind.data(),
            session_id: &self.session_id,
            timestamp: self.timestamp,
        };
        serde_json::to_string(&body).map_err(EventError::Encode)
    }

    /// Decode a log body and attach the log-assigned sequence.
    ///
    /// # Errors
    /// Returns error if `body` is not a valid event envelope.
    pub fn decode_body(sequence: i64, body: &str) -> Result<Self, EventError> {
        let mut event: Self = serde_json::from_str(body).map_err(EventError::Decode)?;
        event.sequence = sequence;
        Ok(event)
    }

    /// Encode the full wire envelope.
    ///
    /// # Errors
    /// Returns error if the envelope cannot be serialized.
    pub fn to_json(&self) -> Result<String, EventError> {
        serde_json::to_string(self).map_err(EventError::Encode)
    }
}

#[derive(Serialize)]
struct BodyRef<'a> {
    #[serde(rename = "type")]
    event_type: &'a str,
    data: Map<String, Value>,
    session_id: &'a str,
    timestamp: DateTime<Utc>,
}

const fn unsequenced() -> i64 {
    UNSEQUENCED
}

#[derive(Serialize, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Map<String, Value>,
    session_id: String,
    #[serde(default = "unsequenced")]
    sequence: i64,
    timestamp: DateTime<Utc>,
}

impl From<WireEvent> for SessionEvent {
    fn from(wire: WireEvent) -> Self {
        Self {
            session_id: wire.session_id,
            sequence: wire.sequence,
            timestamp: wire.timestamp,
            kind: EventKind::from_parts(wire.event_type, wire.data),
        }
    }
}

impl From<SessionEvent> for WireEvent {
    fn from(event: SessionEvent) -> Self {
        let data = event.kind.data();
        let event_type = match event.kind {
            EventKind::Custom { event_type, .. } => event_type,
            other => other.event_type().to_string(),
        };
        Self {
            event_type,
            data,
            session_id: event.session_id,
            sequence: event.sequence,
            timestamp: event.timestamp,
        }
    }
}
