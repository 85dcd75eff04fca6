//! Server-Sent Events delivery for session event streams.
//!
//! Provides:
//! - `DeliveryFilter` - Per-connection dedup by sequence, terminal handling
//! - `DeliveryStream` - Filtered subscription that ends after a terminal event
//! - SSE wire framing and `Last-Event-ID` parsing
//! - Axum response glue (feature: axum)

pub mod delivery;
pub mod protocol;

#[cfg(feature = "axum")]
pub mod response;

pub use delivery::{Delivery, DeliveryFilter, DeliveryStream};
pub use protocol::{LAST_EVENT_ID, ProtocolError, SseFrame, parse_last_event_id};
#[cfg(feature = "axum")]
pub use response::{into_sse, last_event_id, to_axum_event};
