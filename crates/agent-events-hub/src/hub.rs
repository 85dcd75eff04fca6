//! The event hub: one instance per process, shared by cloning.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use agent_events_core::{
    EventKind, EventLog, LogError, NewEvent, PersistSink, SessionEvent, StreamInfo,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    buffer::Subscription,
    config::HubConfig,
    persist::{PersistPool, PersistStats},
    publisher::Publisher,
    stats::{SubscriberId, SubscriberStats},
    subscriptions::{StartFrom, SubscriptionManager},
};

/// Hub error.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),
    #[error("Event hub is closed")]
    Closed,
    #[error(transparent)]
    Log(#[from] LogError),
}

struct Inner {
    log: Arc<dyn EventLog>,
    config: HubConfig,
    subscriptions: Arc<SubscriptionManager>,
    publisher: Publisher,
    persist: Option<Arc<PersistPool>>,
    closed: AtomicBool,
}

/// Session event streaming hub.
///
/// Construct once at startup and pass clones to every producer and consumer.
/// Publishing and delivery are decoupled through the log: `publish` never
/// waits on subscribers, and each subscriber reads the log independently.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Inner>,
}

impl EventHub {
    /// Create a hub without a persistence sink.
    #[must_use]
    pub fn new(log: Arc<dyn EventLog>, config: HubConfig) -> Self {
        Self::build(log, None, config)
    }

    /// Create a hub that archives `persist` events through `sink`.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn with_sink(log: Arc<dyn EventLog>, sink: Arc<dyn PersistSink>, config: HubConfig) -> Self {
        Self::build(log, Some(sink), config)
    }

    fn build(log: Arc<dyn EventLog>, sink: Option<Arc<dyn PersistSink>>, config: HubConfig) -> Self {
        let persist = sink.map(|sink| {
            Arc::new(PersistPool::new(
                sink,
                config.persist_workers,
                config.persist_queue_size,
                config.persist_timeout(),
            ))
        });
        let subscriptions = Arc::new(SubscriptionManager::new(Arc::clone(&log), config.clone()));
        let publisher = Publisher::new(
            Arc::clone(&log),
            Arc::clone(&subscriptions),
            persist.clone(),
            config.max_stream_length,
        );

        Self {
            inner: Arc::new(Inner {
                log,
                config,
                subscriptions,
                publisher,
                persist,
                closed: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    fn ensure_open(&self) -> Result<(), HubError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(HubError::Closed)
        } else {
            Ok(())
        }
    }

    /// Publish an event.
    ///
    /// Store failures do not produce an error: live subscribers receive an
    /// `infrastructure_error` event and `Ok(None)` is returned.
    ///
    /// # Errors
    /// Returns error for an empty session id or a closed hub.
    pub async fn publish(
        &self,
        session_id: &str,
        event: impl Into<NewEvent>,
    ) -> Result<Option<i64>, HubError> {
        validate_session_id(session_id)?;
        self.ensure_open()?;
        Ok(self.inner.publisher.publish(session_id, event.into()).await)
    }

    /// Publish a dynamic payload under `event_type`.
    ///
    /// Payloads that cannot be serialized are coerced to a string.
    ///
    /// # Errors
    /// Returns error for an empty session id or a closed hub.
    pub async fn publish_event<T>(
        &self,
        session_id: &str,
        event_type: &str,
        data: &T,
        persist: bool,
    ) -> Result<Option<i64>, HubError>
    where
        T: Serialize + fmt::Debug + ?Sized,
    {
        let kind = EventKind::from_payload(event_type, data);
        let event = if persist {
            NewEvent::persisted(kind)
        } else {
            NewEvent::new(kind)
        };
        self.publish(session_id, event).await
    }

    /// Read up to `limit` events after `after_sequence` without subscribing.
    ///
    /// Malformed entries are skipped.
    ///
    /// # Errors
    /// Returns error for an empty session id or if the log read fails.
    pub async fn get_events_after(
        &self,
        session_id: &str,
        after_sequence: i64,
        limit: usize,
    ) -> Result<Vec<SessionEvent>, HubError> {
        validate_session_id(session_id)?;
        let records = self
            .inner
            .log
            .read_after(session_id, after_sequence, limit)
            .await?;

        Ok(records
            .iter()
            .filter_map(|record| match record.decode() {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(%session_id, sequence = record.sequence, "Skipping malformed log entry: {e}");
                    None
                }
            })
            .collect())
    }

    /// Stream introspection; `None` if nothing was ever published.
    ///
    /// # Errors
    /// Returns error for an empty session id or if the log is unreachable.
    pub async fn stream_info(&self, session_id: &str) -> Result<Option<StreamInfo>, HubError> {
        validate_session_id(session_id)?;
        Ok(self.inner.log.info(session_id).await?)
    }

    /// Delete a session's stream. Returns true if it existed.
    ///
    /// # Errors
    /// Returns error for an empty session id or if the log is unreachable.
    pub async fn delete_stream(&self, session_id: &str) -> Result<bool, HubError> {
        validate_session_id(session_id)?;
        Ok(self.inner.log.delete(session_id).await?)
    }

    /// Subscribe to a session.
    ///
    /// `None` replays everything still retained; `Some(n)` resumes strictly
    /// after checkpoint `n`.
    ///
    /// # Errors
    /// Returns error for an empty session id or a closed hub.
    pub async fn subscribe(
        &self,
        session_id: &str,
        from_sequence: Option<i64>,
    ) -> Result<Subscription, HubError> {
        self.subscribe_at(session_id, StartFrom::from(from_sequence))
            .await
    }

    /// Subscribe from an explicit start position.
    ///
    /// # Errors
    /// Returns error for an empty session id, or if the hub is closed
    /// before the subscriber is registered.
    pub async fn subscribe_at(
        &self,
        session_id: &str,
        from: StartFrom,
    ) -> Result<Subscription, HubError> {
        validate_session_id(session_id)?;
        self.ensure_open()?;
        self.inner
            .subscriptions
            .subscribe(session_id, from)
            .await
            .ok_or(HubError::Closed)
    }

    /// Remove a subscriber and wait for its listener to stop.
    ///
    /// Returns false if it was not registered.
    pub async fn unsubscribe(&self, session_id: &str, subscriber_id: SubscriberId) -> bool {
        self.inner
            .subscriptions
            .unsubscribe(session_id, subscriber_id)
            .await
    }

    /// Number of live subscribers for a session.
    pub async fn get_subscriber_count(&self, session_id: &str) -> usize {
        self.inner.subscriptions.subscriber_count(session_id).await
    }

    /// Delivery stats of every live subscriber of a session.
    pub async fn get_subscriber_stats(&self, session_id: &str) -> Vec<SubscriberStats> {
        self.inner.subscriptions.subscriber_stats(session_id).await
    }

    /// Persistence counters, if a sink is configured.
    #[must_use]
    pub fn persist_stats(&self) -> Option<PersistStats> {
        self.inner.persist.as_ref().map(|pool| pool.stats())
    }

    /// Stop every listener, drain the persistence queue and release the log.
    ///
    /// Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.subscriptions.close().await;
        if let Some(pool) = &self.inner.persist {
            pool.shutdown().await;
        }
        self.inner.log.close().await;
        info!("Event hub closed");
    }
}

fn validate_session_id(session_id: &str) -> Result<(), HubError> {
    if session_id.trim().is_empty() {
        Err(HubError::InvalidSessionId(session_id.to_string()))
    } else {
        Ok(())
    }
}
