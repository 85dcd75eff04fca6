//! Subscription manager: the registry of live subscribers per session.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use agent_events_core::EventLog;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    buffer::{EventBuffer, Outlet, Subscription},
    config::HubConfig,
    listener::Listener,
    stats::{SubscriberId, SubscriberStats},
};

/// Where a new subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartFrom {
    /// Replay everything still retained.
    #[default]
    Beginning,
    /// Resume strictly after this checkpoint.
    After(i64),
    /// Only events appended after subscribing.
    Latest,
}

impl From<Option<i64>> for StartFrom {
    fn from(from_sequence: Option<i64>) -> Self {
        from_sequence.map_or(Self::Beginning, Self::After)
    }
}

/// Live subscriber state.
struct ActiveSubscriber {
    outlet: Outlet,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ActiveSubscriber {
    /// Cancel the listener and wait for it to stop.
    async fn shutdown(self) -> SubscriberStats {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!(
                    session_id = %self.outlet.session_id,
                    subscriber_id = %self.outlet.subscriber_id,
                    "Listener task panicked: {e}"
                );
            }
        }
        // The listener closes the outlet on exit; close again in case it never ran.
        self.outlet.close();
        self.outlet.stats()
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Vec<ActiveSubscriber>>,
    /// Set by `close`; later subscribes are refused.
    closed: bool,
}

impl Registry {
    fn remove(&mut self, session_id: &str, subscriber_id: SubscriberId) -> Option<ActiveSubscriber> {
        let list = self.sessions.get_mut(session_id)?;
        let removed = list
            .iter()
            .position(|s| s.outlet.subscriber_id == subscriber_id)
            .map(|index| list.swap_remove(index));
        if list.is_empty() {
            self.sessions.remove(session_id);
        }
        removed
    }
}

/// Stops a subscriber's listener and deregisters it when its
/// [`Subscription`] is dropped without an explicit unsubscribe.
pub(crate) struct SubscriptionGuard {
    registry: Weak<RwLock<Registry>>,
    session_id: String,
    subscriber_id: SubscriberId,
    cancel: CancellationToken,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        // Without a runtime the entry stays until `close`; the listener is already cancelled.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let session_id = std::mem::take(&mut self.session_id);
        let subscriber_id = self.subscriber_id;
        runtime.spawn(async move {
            let removed = registry.write().await.remove(&session_id, subscriber_id);
            if let Some(subscriber) = removed {
                let stats = subscriber.shutdown().await;
                log_unsubscribed(&session_id, subscriber_id, &stats);
            }
        });
    }
}

fn log_unsubscribed(session_id: &str, subscriber_id: SubscriberId, stats: &SubscriberStats) {
    if stats.events_dropped > 0 {
        info!(
            %session_id,
            %subscriber_id,
            events_received = stats.events_received,
            events_dropped = stats.events_dropped,
            last_sequence_sent = stats.last_sequence_sent,
            "Unsubscribed after dropping events"
        );
    } else {
        debug!(%session_id, %subscriber_id, "Unsubscribed");
    }
}

/// Tracks subscribers per session and the listener task feeding each one.
///
/// The registry lock is held only for map updates, never across a log read
/// or while waiting for a listener to stop.
pub struct SubscriptionManager {
    log: Arc<dyn EventLog>,
    config: HubConfig,
    registry: Arc<RwLock<Registry>>,
}

impl SubscriptionManager {
    /// Create a new subscription manager.
    #[must_use]
    pub fn new(log: Arc<dyn EventLog>, config: HubConfig) -> Self {
        Self {
            log,
            config,
            registry: Arc::new(RwLock::new(Registry::default())),
        }
    }

    /// Register a subscriber and start its listener.
    ///
    /// [`StartFrom::Latest`] is resolved before returning, so anything
    /// published after this call is delivered. Returns `None` once the
    /// manager is closed, including when `close` runs while resolving.
    pub async fn subscribe(&self, session_id: &str, from: StartFrom) -> Option<Subscription> {
        let start = match from {
            StartFrom::Beginning => Some(0),
            StartFrom::After(sequence) => Some(sequence.max(0)),
            StartFrom::Latest => match self.log.last_sequence(session_id).await {
                Ok(sequence) => Some(sequence),
                Err(e) => {
                    // The listener retries resolution under its read policy.
                    warn!(%session_id, "Could not resolve latest sequence: {e}");
                    None
                }
            },
        };

        let mut registry = self.registry.write().await;
        if registry.closed {
            debug!(%session_id, "Subscribe refused, manager closed");
            return None;
        }

        let subscriber_id = Uuid::new_v4();
        let buffer = EventBuffer::new(self.config.buffer_size);
        let outlet = Outlet::new(subscriber_id, session_id, buffer.clone());
        let cancel = CancellationToken::new();

        let listener = Listener {
            log: Arc::clone(&self.log),
            outlet: outlet.clone(),
            start,
            config: self.config.clone(),
            cancel: cancel.clone(),
        };
        // Spawned under the lock so `close` sees either nothing or the whole subscriber.
        let task = tokio::spawn(listener.run());

        registry
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .push(ActiveSubscriber {
                outlet,
                cancel: cancel.clone(),
                task,
            });
        drop(registry);

        debug!(%session_id, %subscriber_id, ?from, "Subscribed");
        let guard = SubscriptionGuard {
            registry: Arc::downgrade(&self.registry),
            session_id: session_id.to_string(),
            subscriber_id,
            cancel,
        };
        Some(Subscription::new(subscriber_id, session_id.to_string(), buffer, guard))
    }

    /// Remove a subscriber, then cancel its listener and wait for it to stop.
    ///
    /// Returns false if the subscriber was not registered.
    pub async fn unsubscribe(&self, session_id: &str, subscriber_id: SubscriberId) -> bool {
        let removed = self.registry.write().await.remove(session_id, subscriber_id);
        let Some(subscriber) = removed else {
            return false;
        };

        let stats = subscriber.shutdown().await;
        log_unsubscribed(session_id, subscriber_id, &stats);
        true
    }

    /// Number of live subscribers for a session.
    pub async fn subscriber_count(&self, session_id: &str) -> usize {
        self.registry
            .read()
            .await
            .sessions
            .get(session_id)
            .map_or(0, Vec::len)
    }

    /// Delivery stats for every live subscriber of a session.
    pub async fn subscriber_stats(&self, session_id: &str) -> Vec<SubscriberStats> {
        self.registry
            .read()
            .await
            .sessions
            .get(session_id)
            .map(|list| list.iter().map(|s| s.outlet.stats()).collect())
            .unwrap_or_default()
    }

    /// Write sides of every live subscriber of a session.
    pub(crate) async fn outlets(&self, session_id: &str) -> Vec<Outlet> {
        self.registry
            .read()
            .await
            .sessions
            .get(session_id)
            .map(|list| list.iter().map(|s| s.outlet.clone()).collect())
            .unwrap_or_default()
    }

    /// Refuse new subscribers, then cancel every listener concurrently and
    /// wait for all of them.
    pub async fn close(&self) {
        let all = {
            let mut registry = self.registry.write().await;
            registry.closed = true;
            std::mem::take(&mut registry.sessions)
        };
        let shutdowns = all.into_values().flatten().map(ActiveSubscriber::shutdown);
        let stopped = futures::future::join_all(shutdowns).await;
        debug!(count = stopped.len(), "Closed all subscriptions");
    }
}
