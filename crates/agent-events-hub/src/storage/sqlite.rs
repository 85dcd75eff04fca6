//! SQLite event log (feature-gated).
//!
//! Survives process restarts. Blocking reads poll the table, and are woken
//! early by appends made through the same `SqliteLog`.

use std::{str::FromStr, time::Duration};

use agent_events_core::{EventLog, LogError, LogRecord, StreamInfo};
use async_trait::async_trait;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use tokio::{sync::watch, time::Instant};

/// Poll interval for blocking reads when no local append wakes the reader.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

const SCHEMA: [&str; 2] = [
    "CREATE TABLE IF NOT EXISTS session_events (
        session_id TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        body TEXT NOT NULL,
        PRIMARY KEY (session_id, sequence)
    )",
    // Outlives deletes, so sequences never go backwards for a session.
    "CREATE TABLE IF NOT EXISTS session_sequences (
        session_id TEXT PRIMARY KEY,
        last_sequence INTEGER NOT NULL
    )",
];

fn map_err(e: sqlx::Error) -> LogError {
    match e {
        sqlx::Error::PoolClosed => LogError::Closed,
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => LogError::Unavailable(e.to_string()),
        other => LogError::Internal(other.to_string()),
    }
}

/// SQLite log implementation.
pub struct SqliteLog {
    pool: SqlitePool,
    appended: watch::Sender<u64>,
}

impl SqliteLog {
    /// Open (creating if missing) the database at `database_url`.
    ///
    /// # Errors
    /// Returns error if database connection or schema setup fails.
    pub async fn connect(database_url: &str) -> Result<Self, LogError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(map_err)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(map_err)?;
        Self::with_pool(pool).await
    }

    /// Use an existing pool.
    ///
    /// # Errors
    /// Returns error if schema setup fails.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, LogError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(map_err)?;
        }
        let (appended, _) = watch::channel(0);
        Ok(Self { pool, appended })
    }
}

#[async_trait]
impl EventLog for SqliteLog {
    async fn append(
        &self,
        session_id: &str,
        body: String,
        max_len: Option<usize>,
    ) -> Result<i64, LogError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        // The upsert takes the write lock, so concurrent appenders serialize here.
        let sequence: i64 = sqlx::query_scalar(
            "INSERT INTO session_sequences (session_id, last_sequence)
             VALUES (?, (SELECT COALESCE(MAX(sequence), 0) + 1
                         FROM session_events WHERE session_id = ?))
             ON CONFLICT (session_id) DO UPDATE SET last_sequence = last_sequence + 1
             RETURNING last_sequence",
        )
        .bind(session_id)
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_err)?;

        sqlx::query("INSERT INTO session_events (session_id, sequence, body) VALUES (?, ?, ?)")
            .bind(session_id)
            .bind(sequence)
            .bind(body)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;

        if let Some(max_len) = max_len {
            let keep = i64::try_from(max_len.max(1)).unwrap_or(i64::MAX);
            sqlx::query("DELETE FROM session_events WHERE session_id = ? AND sequence <= ?")
                .bind(session_id)
                .bind(sequence.saturating_sub(keep))
                .execute(&mut *tx)
                .await
                .map_err(map_err)?;
        }

        tx.commit().await.map_err(map_err)?;

        self.appended.send_modify(|n| *n = n.wrapping_add(1));
        Ok(sequence)
    }

    async fn read_after(
        &self,
        session_id: &str,
        after: i64,
        limit: usize,
    ) -> Result<Vec<LogRecord>, LogError> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT sequence, body FROM session_events
             WHERE session_id = ? AND sequence > ?
             ORDER BY sequence LIMIT ?",
        )
        .bind(session_id)
        .bind(after)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(rows
            .into_iter()
            .map(|(sequence, body)| LogRecord { sequence, body })
            .collect())
    }

    async fn read_blocking(
        &self,
        session_id: &str,
        after: i64,
        limit: usize,
        block: Duration,
    ) -> Result<Vec<LogRecord>, LogError> {
        let deadline = Instant::now() + block;
        let mut appended = self.appended.subscribe();

        loop {
            let records = self.read_after(session_id, after, limit).await?;
            if !records.is_empty() {
                return Ok(records);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wait = POLL_INTERVAL.min(deadline - now);
            let _ = tokio::time::timeout(wait, appended.changed()).await;
        }
    }

    async fn info(&self, session_id: &str) -> Result<Option<StreamInfo>, LogError> {
        let (length, first, last): (i64, Option<i64>, Option<i64>) = sqlx::query_as(
            "SELECT COUNT(*), MIN(sequence), MAX(sequence)
             FROM session_events WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(match (first, last) {
            (Some(first_sequence), Some(last_sequence)) => Some(StreamInfo {
                length: usize::try_from(length).unwrap_or_default(),
                first_sequence,
                last_sequence,
            }),
            _ => None,
        })
    }

    /// Drops the events but keeps the session's sequence counter.
    async fn delete(&self, session_id: &str) -> Result<bool, LogError> {
        let result = sqlx::query("DELETE FROM session_events WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
