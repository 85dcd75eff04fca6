//! Client-facing delivery rules for one connection.
//!
//! A connection forwards each log position at most once, but never drops a
//! terminal event, and ends right after forwarding one. Heartbeats and other
//! synthetic events carry no position and always pass through.

use std::{
    pin::Pin,
    task::{Context, Poll, ready},
};

use agent_events_core::SessionEvent;
use agent_events_hub::{EventHub, HubError, Subscription};
use futures::{Stream, StreamExt, stream::BoxStream};
use tracing::{debug, trace};

/// What to do with the next event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Forward,
    /// Forward, then end the connection.
    ForwardAndClose,
    /// Already delivered on this connection.
    Skip,
}

/// Per-connection deduplication state.
///
/// Subscriptions deliver sequenced events in increasing order, so the
/// highest sequence forwarded so far identifies everything already seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryFilter {
    last_seen: Option<i64>,
}

impl DeliveryFilter {
    #[must_use]
    pub const fn new() -> Self {
        Self { last_seen: None }
    }

    /// Filter for a reconnect that already saw everything up to `checkpoint`.
    #[must_use]
    pub const fn resuming(checkpoint: Option<i64>) -> Self {
        Self {
            last_seen: checkpoint,
        }
    }

    pub fn decide(&mut self, event: &SessionEvent) -> Delivery {
        if event.is_terminal() {
            self.observe(event);
            return Delivery::ForwardAndClose;
        }
        if !event.is_sequenced() {
            return Delivery::Forward;
        }
        if self.last_seen.is_some_and(|seen| event.sequence <= seen) {
            return Delivery::Skip;
        }
        self.observe(event);
        Delivery::Forward
    }

    /// Sequence to resubscribe from after a disconnect.
    #[must_use]
    pub const fn checkpoint(&self) -> Option<i64> {
        self.last_seen
    }

    fn observe(&mut self, event: &SessionEvent) {
        if event.is_sequenced() {
            self.last_seen = Some(self.last_seen.map_or(event.sequence, |s| s.max(event.sequence)));
        }
    }
}

/// A subscription with the delivery rules applied.
///
/// Ends after forwarding a terminal event, or when the subscription ends.
/// Dropping the stream drops the subscription, which leaves the hub.
pub struct DeliveryStream {
    events: BoxStream<'static, SessionEvent>,
    filter: DeliveryFilter,
    done: bool,
}

impl DeliveryStream {
    #[must_use]
    pub fn new(subscription: Subscription) -> Self {
        Self::with_filter(subscription, DeliveryFilter::new())
    }

    #[must_use]
    pub fn with_filter(subscription: Subscription, filter: DeliveryFilter) -> Self {
        Self {
            events: subscription.into_stream(),
            filter,
            done: false,
        }
    }

    /// Subscribe for a (re)connecting client that last saw `last_event_id`.
    ///
    /// # Errors
    /// Returns error if the hub rejects the subscription.
    pub async fn resume(
        hub: &EventHub,
        session_id: &str,
        last_event_id: Option<i64>,
    ) -> Result<Self, HubError> {
        let subscription = hub.subscribe(session_id, last_event_id).await?;
        debug!(
            %session_id,
            subscriber_id = %subscription.id(),
            ?last_event_id,
            "Delivery stream opened"
        );
        Ok(Self::with_filter(
            subscription,
            DeliveryFilter::resuming(last_event_id),
        ))
    }

    /// Highest sequence forwarded so far.
    #[must_use]
    pub const fn checkpoint(&self) -> Option<i64> {
        self.filter.checkpoint()
    }
}

impl Stream for DeliveryStream {
    type Item = SessionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        loop {
            let Some(event) = ready!(this.events.poll_next_unpin(cx)) else {
                this.done = true;
                return Poll::Ready(None);
            };
            match this.filter.decide(&event) {
                Delivery::Forward => return Poll::Ready(Some(event)),
                Delivery::ForwardAndClose => {
                    this.done = true;
                    return Poll::Ready(Some(event));
                }
                Delivery::Skip => {
                    trace!(sequence = event.sequence, "Skipping duplicate event");
                }
            }
        }
    }
}
