//! Bounded per-subscriber buffer with drop-oldest backpressure.
//!
//! The buffer decouples log-read cadence from client-read cadence. When it
//! is full, the oldest buffered non-terminal event is evicted to make room:
//! live clients favour freshness, and the log itself stays the system of
//! record for replay. A buffered terminal event is only evicted when nothing
//! else is left to evict.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use agent_events_core::SessionEvent;
use futures::stream::BoxStream;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::{
    stats::{StatsCounters, SubscriberId, SubscriberStats},
    subscriptions::SubscriptionGuard,
};

struct Shared {
    queue: Mutex<VecDeque<SessionEvent>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

/// Shared handle to a bounded event queue.
#[derive(Clone)]
pub(crate) struct EventBuffer {
    shared: Arc<Shared>,
}

impl EventBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                capacity,
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<SessionEvent>> {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Push an event, returning the evicted event if the buffer was full.
    ///
    /// Pushes after [`EventBuffer::close`] are discarded.
    pub(crate) fn push(&self, event: SessionEvent) -> Option<SessionEvent> {
        if self.is_closed() {
            return None;
        }
        let evicted = {
            let mut queue = self.queue();
            let evicted = if queue.len() >= self.shared.capacity {
                let index = queue.iter().position(|e| !e.is_terminal()).unwrap_or(0);
                queue.remove(index)
            } else {
                None
            };
            queue.push_back(event);
            evicted
        };
        self.shared.notify.notify_one();
        evicted
    }

    /// Mark the end of the stream. Buffered events can still be drained.
    pub(crate) fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn len(&self) -> usize {
        self.queue().len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub(crate) fn try_recv(&self) -> Option<SessionEvent> {
        self.queue().pop_front()
    }

    /// Wait for the next event; `None` once closed and drained.
    pub(crate) async fn recv(&self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.is_closed() {
                return self.try_recv();
            }
            self.shared.notify.notified().await;
        }
    }
}

/// Write side of a subscriber: its buffer plus delivery accounting.
///
/// Held by the subscriber's listener task, and by the registry so the
/// publisher can surface infrastructure errors directly.
#[derive(Clone)]
pub(crate) struct Outlet {
    pub(crate) subscriber_id: SubscriberId,
    pub(crate) session_id: Arc<str>,
    buffer: EventBuffer,
    stats: Arc<StatsCounters>,
}

impl Outlet {
    pub(crate) fn new(subscriber_id: SubscriberId, session_id: &str, buffer: EventBuffer) -> Self {
        Self {
            subscriber_id,
            session_id: Arc::from(session_id),
            buffer,
            stats: Arc::new(StatsCounters::default()),
        }
    }

    /// Push with drop-oldest backpressure and update the counters.
    pub(crate) fn deliver(&self, event: SessionEvent) {
        if self.buffer.is_closed() {
            debug!(
                session_id = %self.session_id,
                subscriber_id = %self.subscriber_id,
                event_type = event.event_type(),
                "Discarding event for closed subscriber"
            );
            return;
        }
        let sequence = event.sequence;
        if let Some(dropped) = self.buffer.push(event) {
            self.stats.record_dropped();
            warn!(
                session_id = %self.session_id,
                subscriber_id = %self.subscriber_id,
                dropped_sequence = dropped.sequence,
                dropped_type = dropped.event_type(),
                capacity = self.buffer.capacity(),
                "Subscriber buffer full, dropped oldest event"
            );
        }
        self.stats.record_received(sequence);
    }

    pub(crate) fn close(&self) {
        self.buffer.close();
    }

    pub(crate) fn stats(&self) -> SubscriberStats {
        let buffer_size = self.buffer.len();
        SubscriberStats {
            subscriber_id: self.subscriber_id,
            events_received: self.stats.received(),
            events_dropped: self.stats.dropped(),
            last_sequence_sent: self.stats.last_sequence(),
            buffer_size,
            buffer_capacity: self.buffer.capacity(),
            buffer_full: buffer_size >= self.buffer.capacity(),
        }
    }
}

/// Closes the outlet when dropped, so consumers always observe end-of-stream.
pub(crate) struct CloseOnDrop(pub(crate) Outlet);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Read side of a subscription.
///
/// Events arrive in non-decreasing sequence order, interleaved with
/// synthetic events (heartbeats, infrastructure errors, gap markers).
/// `recv` returns `None` once the subscription has been cancelled or its
/// listener gave up, and everything buffered has been drained.
///
/// Dropping a subscription stops its listener and removes it from the hub,
/// as [`EventHub::unsubscribe`](crate::EventHub::unsubscribe) would.
pub struct Subscription {
    id: SubscriberId,
    session_id: String,
    buffer: EventBuffer,
    _guard: SubscriptionGuard,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriberId,
        session_id: String,
        buffer: EventBuffer,
        guard: SubscriptionGuard,
    ) -> Self {
        Self {
            id,
            session_id,
            buffer,
            _guard: guard,
        }
    }

    /// Identifier to pass to [`EventHub::unsubscribe`](crate::EventHub::unsubscribe).
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Receive the next event.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.buffer.recv().await
    }

    /// Receive a buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.buffer.try_recv()
    }

    /// Number of events waiting in the buffer.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true once no further events will be pushed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.buffer.is_closed()
    }

    /// Convert into a stream of events.
    #[must_use]
    pub fn into_stream(self) -> BoxStream<'static, SessionEvent> {
        Box::pin(futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        }))
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("buffered", &self.buffered())
            .finish_non_exhaustive()
    }
}
