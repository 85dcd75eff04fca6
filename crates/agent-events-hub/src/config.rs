//! Hub configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bound for the listener's read retry backoff.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Tuning knobs for an [`EventHub`](crate::EventHub).
///
/// Every field has a default, so partial documents deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Capacity of each subscriber's local buffer.
    pub buffer_size: usize,
    /// Blocking read window; a window with no events yields a heartbeat.
    pub block_ms: u64,
    /// Maximum entries fetched per read.
    pub read_batch: usize,
    /// Retention per session stream. `None` disables trimming.
    pub max_stream_length: Option<usize>,
    /// Consecutive read failures tolerated before a listener gives up.
    pub read_retry_limit: u32,
    /// First retry delay, doubled per attempt.
    pub read_retry_backoff_ms: u64,
    /// Persistence sink workers.
    pub persist_workers: usize,
    /// Queue capacity per persistence worker.
    pub persist_queue_size: usize,
    /// Timeout for a single sink call.
    pub persist_timeout_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            buffer_size: 500,
            block_ms: 30_000,
            read_batch: 100,
            max_stream_length: Some(10_000),
            read_retry_limit: 5,
            read_retry_backoff_ms: 100,
            persist_workers: 4,
            persist_queue_size: 1024,
            persist_timeout_ms: 5_000,
        }
    }
}

impl HubConfig {
    #[must_use]
    pub const fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    #[must_use]
    pub const fn with_block_ms(mut self, block_ms: u64) -> Self {
        self.block_ms = block_ms;
        self
    }

    #[must_use]
    pub const fn with_max_stream_length(mut self, max_stream_length: Option<usize>) -> Self {
        self.max_stream_length = max_stream_length;
        self
    }

    #[must_use]
    pub const fn with_read_retry(mut self, limit: u32, backoff_ms: u64) -> Self {
        self.read_retry_limit = limit;
        self.read_retry_backoff_ms = backoff_ms;
        self
    }

    #[must_use]
    pub const fn with_persist_timeout_ms(mut self, persist_timeout_ms: u64) -> Self {
        self.persist_timeout_ms = persist_timeout_ms;
        self
    }

    #[must_use]
    pub const fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    #[must_use]
    pub const fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.read_retry_backoff_ms)
            .saturating_mul(factor)
            .min(MAX_RETRY_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: HubConfig = serde_json::from_str(r#"{"buffer_size": 5}"#).unwrap();
        assert_eq!(config.buffer_size, 5);
        assert_eq!(config.block_ms, 30_000);
        assert_eq!(config.max_stream_length, Some(10_000));
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let config = HubConfig::default().with_read_retry(5, 100);
        assert_eq!(config.retry_delay(1), Duration::from_millis(100));
        assert_eq!(config.retry_delay(2), Duration::from_millis(200));
        assert_eq!(config.retry_delay(4), Duration::from_millis(800));
        assert_eq!(config.retry_delay(30), MAX_RETRY_BACKOFF);
    }
}
