//! Publish/subscribe hub over a durable per-session event log.
//!
//! Provides:
//! - `EventHub` - Publish, replay and subscribe to session events
//! - `Subscription` - Bounded, drop-oldest buffer fed by a listener task
//! - Log implementations (memory, SQLite)

pub mod buffer;
pub mod config;
pub mod hub;
mod listener;
pub mod persist;
pub mod publisher;
pub mod stats;
pub mod storage;
pub mod subscriptions;

pub use buffer::Subscription;
pub use config::HubConfig;
pub use hub::{EventHub, HubError};
pub use persist::PersistStats;
pub use stats::{SubscriberId, SubscriberStats};
pub use subscriptions::StartFrom;
