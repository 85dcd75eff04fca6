//! Core traits for the durable event log and the persistence sink.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use thiserror::Error;

use crate::event::{EventError, SessionEvent};

/// Log key for a session stream.
#[must_use]
pub fn stream_key(session_id: &str) -> String {
    format!("session:{session_id}:events")
}

/// A raw entry read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Log-assigned sequence, strictly increasing per session.
    pub sequence: i64,
    /// Encoded event body (see [`SessionEvent::encode_body`]).
    pub body: String,
}

impl LogRecord {
    /// Decode the body into an event carrying this record's sequence.
    ///
    /// # Errors
    /// Returns error if the body is malformed.
    pub fn decode(&self) -> Result<SessionEvent, EventError> {
        SessionEvent::decode_body(self.sequence, &self.body)
    }
}

/// Introspection data for one session stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    /// Number of retained entries.
    pub length: usize,
    /// Oldest retained sequence.
    pub first_sequence: i64,
    /// Newest sequence ever appended.
    pub last_sequence: i64,
}

/// Item yielded by [`tail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailItem {
    Record(LogRecord),
    /// The blocking window elapsed with no new entries.
    Idle,
}

/// Log store error.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Log store unavailable: {0}")]
    Unavailable(String),
    #[error("Log store error: {0}")]
    Internal(String),
    #[error("Log store closed")]
    Closed,
}

/// Append-only, replayable, multi-reader log keyed by session.
///
/// Implementations must tolerate concurrent appenders and readers on the
/// same session without client-side locking. Errors are returned as-is;
/// retries are the caller's concern.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append an encoded body, returning the assigned sequence.
    ///
    /// When `max_len` is set, the stream is trimmed to at most that many
    /// entries, oldest first.
    async fn append(
        &self,
        session_id: &str,
        body: String,
        max_len: Option<usize>,
    ) -> Result<i64, LogError>;

    /// Read up to `limit` entries with sequence greater than `after`.
    async fn read_after(
        &self,
        session_id: &str,
        after: i64,
        limit: usize,
    ) -> Result<Vec<LogRecord>, LogError>;

    /// Like [`EventLog::read_after`], but waits up to `block` for entries
    /// to arrive. Returns an empty batch on timeout.
    async fn read_blocking(
        &self,
        session_id: &str,
        after: i64,
        limit: usize,
        block: Duration,
    ) -> Result<Vec<LogRecord>, LogError>;

    /// Stream introspection; `None` if the stream does not exist.
    async fn info(&self, session_id: &str) -> Result<Option<StreamInfo>, LogError>;

    /// Newest sequence of the stream, or 0 if it does not exist.
    async fn last_sequence(&self, session_id: &str) -> Result<i64, LogError> {
        Ok(self.info(session_id).await?.map_or(0, |i| i.last_sequence))
    }

    /// Delete a stream. Returns true if it existed.
    ///
    /// Later appends to the same session continue after the last sequence
    /// it ever assigned, so live cursors stay valid.
    async fn delete(&self, session_id: &str) -> Result<bool, LogError>;

    /// Release connections held by the store.
    async fn close(&self) {}
}

/// Follow a session stream from `after`, blocking up to `block` per read.
///
/// Yields every record in order and [`TailItem::Idle`] for each empty
/// blocking window. Read errors are yielded and the next poll retries
/// from the same position.
pub fn tail(
    log: Arc<dyn EventLog>,
    session_id: String,
    after: i64,
    limit: usize,
    block: Duration,
) -> BoxStream<'static, Result<TailItem, LogError>> {
    futures::stream::unfold(
        (log, session_id, after),
        move |(log, session_id, cursor)| async move {
            let (items, next) = match log.read_blocking(&session_id, cursor, limit, block).await {
                Ok(records) if records.is_empty() => (vec![Ok(TailItem::Idle)], cursor),
                Ok(records) => {
                    let next = records.last().map_or(cursor, |r| r.sequence);
                    let items = records.into_iter().map(|r| Ok(TailItem::Record(r))).collect();
                    (items, next)
                }
                Err(e) => (vec![Err(e)], cursor),
            };
            Some((futures::stream::iter(items), (log, session_id, next)))
        },
    )
    .flatten()
    .boxed()
}

/// Sink error.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Persist failed: {0}")]
    Failed(String),
    #[error("Persist timed out")]
    TimedOut,
}

/// Secondary archive for events published with `persist = true`.
///
/// Invoked once per event, sequentially per session, after the append attempt.
#[async_trait]
pub trait PersistSink: Send + Sync {
    /// Archive one event. `event.sequence` is unsequenced if the append failed.
    async fn persist(&self, event: &SessionEvent) -> Result<(), SinkError>;
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Serves scripted batches, then idles.
    struct ScriptedLog {
        batches: Mutex<Vec<Result<Vec<LogRecord>, LogError>>>,
    }

    #[async_trait]
    impl EventLog for ScriptedLog {
        async fn append(&self, _: &str, _: String, _: Option<usize>) -> Result<i64, LogError> {
            Err(LogError::Closed)
        }

        async fn read_after(&self, _: &str, _: i64, _: usize) -> Result<Vec<LogRecord>, LogError> {
            Ok(Vec::new())
        }

        async fn read_blocking(
            &self,
            _: &str,
            _: i64,
            _: usize,
            _: Duration,
        ) -> Result<Vec<LogRecord>, LogError> {
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                Ok(Vec::new())
            } else {
                batches.remove(0)
            }
        }

        async fn info(&self, _: &str) -> Result<Option<StreamInfo>, LogError> {
            Ok(None)
        }

        async fn delete(&self, _: &str) -> Result<bool, LogError> {
            Ok(false)
        }
    }

    fn record(sequence: i64) -> LogRecord {
        LogRecord {
            sequence,
            body: String::new(),
        }
    }

    #[test]
    fn test_stream_key() {
        assert_eq!(stream_key("abc"), "session:abc:events");
    }

    #[tokio::test]
    async fn test_tail_yields_records_errors_and_idle() {
        let log = Arc::new(ScriptedLog {
            batches: Mutex::new(vec![
                Ok(vec![record(1), record(2)]),
                Err(LogError::Unavailable("down".to_string())),
                Ok(vec![record(3)]),
            ]),
        });

        let items: Vec<_> = tail(log, "s1".to_string(), 0, 10, Duration::from_millis(1))
            .take(5)
            .collect()
            .await;

        assert!(matches!(&items[0], Ok(TailItem::Record(r)) if r.sequence == 1));
        assert!(matches!(&items[1], Ok(TailItem::Record(r)) if r.sequence == 2));
        assert!(matches!(&items[2], Err(LogError::Unavailable(_))));
        assert!(matches!(&items[3], Ok(TailItem::Record(r)) if r.sequence == 3));
        assert!(matches!(&items[4], Ok(TailItem::Idle)));
    }

    #[tokio::test]
    async fn test_default_last_sequence_for_missing_stream() {
        let log = ScriptedLog {
            batches: Mutex::new(Vec::new()),
        };
        assert_eq!(log.last_sequence("missing").await.unwrap(), 0);
    }
}
