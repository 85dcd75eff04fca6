//! Listener task: one per subscriber, feeding its buffer from the log.

use std::sync::Arc;

use agent_events_core::{EventLog, LogError, SessionEvent, TailItem, tail};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    buffer::{CloseOnDrop, Outlet},
    config::HubConfig,
};

/// Error type reported when a listener stops retrying reads.
const READ_FAILED: &str = "log_read_failed";

pub(crate) struct Listener {
    pub(crate) log: Arc<dyn EventLog>,
    pub(crate) outlet: Outlet,
    /// Read strictly after this sequence; `None` means "latest", resolved on start.
    pub(crate) start: Option<i64>,
    pub(crate) config: HubConfig,
    pub(crate) cancel: CancellationToken,
}

impl Listener {
    /// Run until cancelled or until reads keep failing past the retry limit.
    ///
    /// The outlet is closed on exit, whatever the cause.
    pub(crate) async fn run(self) {
        let _close = CloseOnDrop(self.outlet.clone());

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                debug!(
                    session_id = %self.outlet.session_id,
                    subscriber_id = %self.outlet.subscriber_id,
                    "Listener cancelled"
                );
            }
            () = self.listen() => {}
        }
    }

    async fn listen(&self) {
        let session_id = self.outlet.session_id.to_string();
        let Some(mut cursor) = self.resolve_start(&session_id).await else {
            return;
        };
        debug!(
            %session_id,
            subscriber_id = %self.outlet.subscriber_id,
            after = cursor,
            "Listener started"
        );

        let mut records = tail(
            Arc::clone(&self.log),
            session_id.clone(),
            cursor,
            self.config.read_batch.max(1),
            self.config.block_timeout(),
        );
        let mut failures = 0u32;

        while let Some(item) = records.next().await {
            match item {
                Ok(TailItem::Record(record)) => {
                    failures = 0;
                    if cursor > 0 && record.sequence > cursor + 1 {
                        warn!(
                            %session_id,
                            subscriber_id = %self.outlet.subscriber_id,
                            requested_after = cursor,
                            resumed_at = record.sequence,
                            "Events between checkpoint and earliest retained entry were trimmed"
                        );
                        self.outlet
                            .deliver(SessionEvent::stream_gap(&session_id, cursor, record.sequence));
                    }
                    cursor = record.sequence;

                    match record.decode() {
                        Ok(event) => self.outlet.deliver(event),
                        Err(e) => warn!(
                            %session_id,
                            sequence = record.sequence,
                            "Skipping malformed log entry: {e}"
                        ),
                    }
                }
                Ok(TailItem::Idle) => {
                    failures = 0;
                    self.outlet.deliver(SessionEvent::heartbeat(&session_id, cursor));
                }
                Err(e) => {
                    failures += 1;
                    if !self.backoff(&session_id, failures, &e).await {
                        return;
                    }
                }
            }
        }
    }

    async fn resolve_start(&self, session_id: &str) -> Option<i64> {
        if let Some(start) = self.start {
            return Some(start);
        }
        let mut failures = 0u32;
        loop {
            match self.log.last_sequence(session_id).await {
                Ok(sequence) => return Some(sequence),
                Err(e) => {
                    failures += 1;
                    if !self.backoff(session_id, failures, &e).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleep before the next attempt. Returns false, after surfacing the
    /// failure to the subscriber, once the retry limit is exhausted.
    async fn backoff(&self, session_id: &str, failures: u32, err: &LogError) -> bool {
        if failures > self.config.read_retry_limit {
            error!(
                %session_id,
                subscriber_id = %self.outlet.subscriber_id,
                failures,
                "Giving up on log reads: {err}"
            );
            self.outlet.deliver(SessionEvent::infrastructure_error(
                session_id,
                READ_FAILED,
                format!("event log read failed after {failures} attempts: {err}"),
            ));
            return false;
        }

        let delay = self.config.retry_delay(failures);
        warn!(
            %session_id,
            subscriber_id = %self.outlet.subscriber_id,
            failures,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Log read failed, retrying: {err}"
        );
        tokio::time::sleep(delay).await;
        true
    }
}
