//! Core abstractions for agent session event streaming.
//!
//! This crate provides the fundamental building blocks:
//! - `SessionEvent` - Wire envelope around a typed `EventKind`
//! - `EventLog` - Durable, replayable per-session log
//! - `PersistSink` - Secondary archive for persisted events

pub mod event;
pub mod traits;

pub use event::{
    EventError, EventKind, NewEvent, SessionEvent, TERMINAL_EVENT_TYPES, UNSEQUENCED,
    is_terminal_type, to_json_safe,
};
pub use traits::{
    EventLog, LogError, LogRecord, PersistSink, SinkError, StreamInfo, TailItem, stream_key, tail,
};
