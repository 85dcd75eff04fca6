//! Publisher: appends events to the log and hands persisted ones to the sink.

use std::sync::Arc;

use agent_events_core::{EventLog, LogError, NewEvent, SessionEvent};
use tracing::{debug, error, warn};

use crate::{persist::PersistPool, subscriptions::SubscriptionManager};

/// Appends events to the durable log.
///
/// Transient failures never reach the caller: they are logged and surfaced
/// to the session's live subscribers as an `infrastructure_error` event,
/// while persisted events still reach the sink.
pub struct Publisher {
    log: Arc<dyn EventLog>,
    subscriptions: Arc<SubscriptionManager>,
    persist: Option<Arc<PersistPool>>,
    max_stream_length: Option<usize>,
}

impl Publisher {
    /// Create a new publisher.
    #[must_use]
    pub fn new(
        log: Arc<dyn EventLog>,
        subscriptions: Arc<SubscriptionManager>,
        persist: Option<Arc<PersistPool>>,
        max_stream_length: Option<usize>,
    ) -> Self {
        Self {
            log,
            subscriptions,
            persist,
            max_stream_length,
        }
    }

    /// Publish an event to a session.
    ///
    /// Returns the assigned sequence, or `None` if the append failed.
    pub async fn publish(&self, session_id: &str, new_event: NewEvent) -> Option<i64> {
        let NewEvent { kind, persist } = new_event;
        let mut event = SessionEvent::new(session_id, kind);

        let appended = match event.encode_body() {
            Ok(body) => self
                .log
                .append(session_id, body, self.max_stream_length)
                .await
                .map_err(|e| (error_type(&e), e.to_string())),
            Err(e) => Err(("serialization_error", e.to_string())),
        };

        let sequence = match appended {
            Ok(sequence) => {
                event.sequence = sequence;
                debug!(%session_id, sequence, event_type = event.event_type(), "Published");
                Some(sequence)
            }
            Err((error_type, message)) => {
                error!(
                    %session_id,
                    event_type = event.event_type(),
                    error_type,
                    "Failed to append event: {message}"
                );
                self.notify_failure(session_id, error_type, &message).await;
                None
            }
        };

        if persist {
            if let Some(pool) = &self.persist {
                if !pool.submit(event).await {
                    warn!(%session_id, "Persistence pool closed, event not archived");
                }
            }
        }

        sequence
    }

    /// Push an infrastructure error straight into every local buffer of the
    /// session, bypassing the log.
    async fn notify_failure(&self, session_id: &str, error_type: &str, message: &str) {
        let outlets = self.subscriptions.outlets(session_id).await;
        if outlets.is_empty() {
            return;
        }
        warn!(
            %session_id,
            subscribers = outlets.len(),
            error_type,
            "Notifying subscribers of publish failure"
        );
        let notice = SessionEvent::infrastructure_error(
            session_id,
            error_type,
            format!("failed to record event: {message}"),
        );
        for outlet in outlets {
            outlet.deliver(notice.clone());
        }
    }
}

fn error_type(e: &LogError) -> &'static str {
    match e {
        LogError::Unavailable(_) | LogError::Closed => "log_unavailable",
        LogError::Internal(_) => "log_error",
    }
}
