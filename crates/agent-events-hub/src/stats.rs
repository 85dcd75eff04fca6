//! Per-subscriber delivery counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;
use uuid::Uuid;

/// Subscriber identifier.
pub type SubscriberId = Uuid;

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    received: AtomicU64,
    dropped: AtomicU64,
    last_sequence: AtomicI64,
}

impl StatsCounters {
    pub(crate) fn record_received(&self, sequence: i64) {
        self.received.fetch_add(1, Ordering::Relaxed);
        if sequence > 0 {
            self.last_sequence.fetch_max(sequence, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn last_sequence(&self) -> i64 {
        self.last_sequence.load(Ordering::Relaxed)
    }
}

/// Snapshot of one subscriber's delivery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubscriberStats {
    pub subscriber_id: SubscriberId,
    /// Events pushed into the local buffer, synthetic ones included.
    pub events_received: u64,
    /// Events evicted from a full buffer.
    pub events_dropped: u64,
    /// Highest log sequence pushed, 0 if none yet.
    pub last_sequence_sent: i64,
    /// Events currently buffered.
    pub buffer_size: usize,
    pub buffer_capacity: usize,
    pub buffer_full: bool,
}
