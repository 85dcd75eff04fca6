//! In-memory event log.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use agent_events_core::{EventLog, LogError, LogRecord, StreamInfo};
use async_trait::async_trait;
use tokio::{sync::watch, time::Instant};

struct Stream {
    entries: VecDeque<LogRecord>,
    last_sequence: i64,
    appended: watch::Sender<i64>,
}

impl Stream {
    fn new() -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            entries: VecDeque::new(),
            last_sequence: 0,
            appended,
        }
    }

    fn after(&self, after: i64, limit: usize) -> Vec<LogRecord> {
        let start = self.entries.partition_point(|r| r.sequence <= after);
        self.entries.range(start..).take(limit).cloned().collect()
    }
}

/// In-memory log implementation.
///
/// Useful for development, tests and single-process deployments.
/// Data is lost on restart. Deleting a stream drops its entries but keeps
/// its last sequence, so a recreated stream continues where it left off.
pub struct MemoryLog {
    streams: RwLock<HashMap<String, Stream>>,
    /// Bumped whenever a stream is first created; wakes readers of missing streams.
    created: watch::Sender<i64>,
    available: AtomicBool,
}

impl MemoryLog {
    /// Create a new in-memory log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            created: watch::channel(0).0,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`LogError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), LogError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LogError::Unavailable("memory log marked unavailable".to_string()))
        }
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventLog for MemoryLog {
    async fn append(
        &self,
        session_id: &str,
        body: String,
        max_len: Option<usize>,
    ) -> Result<i64, LogError> {
        self.check_available()?;

        let mut streams = self
            .streams
            .write()
            .map_err(|e| LogError::Internal(e.to_string()))?;

        let is_new = !streams.contains_key(session_id);
        let stream = streams
            .entry(session_id.to_string())
            .or_insert_with(Stream::new);

        stream.last_sequence += 1;
        let sequence = stream.last_sequence;
        stream.entries.push_back(LogRecord { sequence, body });

        if let Some(max_len) = max_len {
            while stream.entries.len() > max_len.max(1) {
                stream.entries.pop_front();
            }
        }

        stream.appended.send_replace(sequence);
        if is_new {
            self.created.send_modify(|n| *n = n.wrapping_add(1));
        }
        Ok(sequence)
    }

    async fn read_after(
        &self,
        session_id: &str,
        after: i64,
        limit: usize,
    ) -> Result<Vec<LogRecord>, LogError> {
        self.check_available()?;

        Ok(self
            .streams
            .read()
            .map_err(|e| LogError::Internal(e.to_string()))?
            .get(session_id)
            .map(|s| s.after(after, limit))
            .unwrap_or_default())
    }

    async fn read_blocking(
        &self,
        session_id: &str,
        after: i64,
        limit: usize,
        block: Duration,
    ) -> Result<Vec<LogRecord>, LogError> {
        let deadline = Instant::now() + block;

        loop {
            self.check_available()?;

            // Subscribed under the read lock, so no append can slip in between.
            let mut wake = {
                let streams = self
                    .streams
                    .read()
                    .map_err(|e| LogError::Internal(e.to_string()))?;

                match streams.get(session_id) {
                    Some(stream) => {
                        let records = stream.after(after, limit);
                        if !records.is_empty() {
                            return Ok(records);
                        }
                        stream.appended.subscribe()
                    }
                    None => self.created.subscribe(),
                }
            };

            if tokio::time::timeout_at(deadline, wake.changed())
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }

    async fn info(&self, session_id: &str) -> Result<Option<StreamInfo>, LogError> {
        self.check_available()?;

        Ok(self
            .streams
            .read()
            .map_err(|e| LogError::Internal(e.to_string()))?
            .get(session_id)
            .filter(|s| !s.entries.is_empty())
            .map(|s| StreamInfo {
                length: s.entries.len(),
                first_sequence: s.entries.front().map_or(0, |r| r.sequence),
                last_sequence: s.last_sequence,
            }))
    }

    async fn delete(&self, session_id: &str) -> Result<bool, LogError> {
        self.check_available()?;

        let mut streams = self
            .streams
            .write()
            .map_err(|e| LogError::Internal(e.to_string()))?;

        Ok(streams.get_mut(session_id).is_some_and(|stream| {
            let existed = !stream.entries.is_empty();
            stream.entries.clear();
            existed
        }))
    }
}
