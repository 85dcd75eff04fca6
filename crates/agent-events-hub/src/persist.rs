//! Supervised worker pool feeding the secondary persistence sink.
//!
//! Events are routed to a worker by session, so one session's events are
//! persisted sequentially and in publish order, while different sessions
//! proceed in parallel. Queues are bounded: a slow sink slows publishers
//! down instead of accumulating unbounded work.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use agent_events_core::{PersistSink, SessionEvent};
use futures::FutureExt;
use serde::Serialize;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, warn};

/// Persistence pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistStats {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

/// Bounded, per-session-ordered sink workers.
pub struct PersistPool {
    senders: Mutex<Option<Vec<mpsc::Sender<SessionEvent>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl PersistPool {
    /// Spawn `workers` workers, each with a queue of `queue_size` events.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(
        sink: Arc<dyn PersistSink>,
        workers: usize,
        queue_size: usize,
        timeout: Duration,
    ) -> Self {
        let counters = Arc::new(Counters::default());
        let (senders, handles): (Vec<_>, Vec<_>) = (0..workers.max(1))
            .map(|index| {
                let (tx, rx) = mpsc::channel(queue_size.max(1));
                let handle = tokio::spawn(run_worker(
                    index,
                    rx,
                    Arc::clone(&sink),
                    timeout,
                    Arc::clone(&counters),
                ));
                (tx, handle)
            })
            .unzip();

        Self {
            senders: Mutex::new(Some(senders)),
            workers: Mutex::new(handles),
            counters,
        }
    }

    /// Queue an event, waiting for capacity if the session's worker is busy.
    ///
    /// Returns false if the pool has been shut down.
    pub async fn submit(&self, event: SessionEvent) -> bool {
        let sender = {
            let senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(senders) = senders.as_ref() else {
                return false;
            };
            senders[worker_index(&event.session_id, senders.len())].clone()
        };

        if sender.send(event).await.is_err() {
            return false;
        }
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PersistStats {
        PersistStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting events, drain the queues and wait for the workers.
    pub async fn shutdown(&self) {
        drop(
            self.senders
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Persistence worker failed: {e}");
            }
        }
    }
}

fn worker_index(session_id: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    session_id.hash(&mut hasher);
    usize::try_from(hasher.finish() % workers as u64).unwrap_or(0)
}

async fn run_worker(
    index: usize,
    mut rx: mpsc::Receiver<SessionEvent>,
    sink: Arc<dyn PersistSink>,
    timeout: Duration,
    counters: Arc<Counters>,
) {
    while let Some(event) = rx.recv().await {
        // A panicking sink must not take the worker (and its queue) down.
        let call = AssertUnwindSafe(sink.persist(&event)).catch_unwind();
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(Ok(()))) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Ok(Err(e))) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    session_id = %event.session_id,
                    sequence = event.sequence,
                    event_type = event.event_type(),
                    "Persist failed: {e}"
                );
            }
            Ok(Err(_)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    session_id = %event.session_id,
                    sequence = event.sequence,
                    "Persist sink panicked"
                );
            }
            Err(_) => {
                counters.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(
                    session_id = %event.session_id,
                    sequence = event.sequence,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "Persist timed out"
                );
            }
        }
    }
    debug!(worker = index, "Persistence worker stopped");
}
