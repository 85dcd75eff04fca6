//! End-to-end behavior of the hub over the in-memory log.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use agent_events_core::{
    EventKind, EventLog, LogError, LogRecord, NewEvent, PersistSink, SessionEvent, SinkError,
    StreamInfo, UNSEQUENCED,
};
use agent_events_hub::{EventHub, HubConfig, HubError, StartFrom, Subscription, storage::MemoryLog};
use async_trait::async_trait;
use serde_json::json;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<SessionEvent>>,
}

#[async_trait]
impl PersistSink for RecordingSink {
    async fn persist(&self, event: &SessionEvent) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Long block window so idle heartbeats stay out of the way.
fn quiet_config() -> HubConfig {
    HubConfig::default().with_block_ms(10_000)
}

fn setup(config: HubConfig) -> (Arc<MemoryLog>, EventHub) {
    let log = Arc::new(MemoryLog::new());
    let hub = EventHub::new(log.clone(), config);
    (log, hub)
}

fn indexed(i: usize) -> EventKind {
    EventKind::custom("test", &json!({ "index": i }))
}

async fn next_event(sub: &mut Subscription) -> SessionEvent {
    tokio::time::timeout(WAIT, sub.recv())
        .await
        .expect("timed out waiting for event")
        .expect("subscription ended")
}

async fn collect(sub: &mut Subscription, n: usize) -> Vec<SessionEvent> {
    let mut events = Vec::with_capacity(n);
    while events.len() < n {
        let event = next_event(sub).await;
        if event.event_type() != "heartbeat" {
            events.push(event);
        }
    }
    events
}

fn sequences(events: &[SessionEvent]) -> Vec<i64> {
    events.iter().map(|e| e.sequence).collect()
}

#[tokio::test]
async fn test_subscriber_receives_published_events_in_order() {
    let (_log, hub) = setup(quiet_config());
    for i in 0..5 {
        hub.publish("s1", indexed(i)).await.unwrap();
    }

    let mut sub = hub.subscribe("s1", None).await.unwrap();
    let events = collect(&mut sub, 5).await;

    let indexes: Vec<_> = events
        .iter()
        .map(|e| e.kind.data()["index"].as_u64().unwrap())
        .collect();
    assert_eq!(indexes, vec![0, 1, 2, 3, 4]);
    assert_eq!(sequences(&events), vec![1, 2, 3, 4, 5]);
    assert!(events.iter().all(|e| e.session_id == "s1"));
}

#[tokio::test]
async fn test_late_subscriber_replays_full_history_then_live() {
    let (_log, hub) = setup(quiet_config());
    for i in 0..50 {
        hub.publish("late", indexed(i)).await.unwrap();
    }

    let mut sub = hub.subscribe("late", None).await.unwrap();
    let replayed = collect(&mut sub, 50).await;
    assert_eq!(sequences(&replayed), (1..=50).collect::<Vec<_>>());

    hub.publish("late", indexed(50)).await.unwrap();
    let live = next_event(&mut sub).await;
    assert_eq!(live.sequence, 51);
}

#[tokio::test]
async fn test_resume_from_checkpoint_skips_seen_events() {
    let (_log, hub) = setup(quiet_config());
    for i in 0..20 {
        hub.publish("resume", indexed(i)).await.unwrap();
    }

    let mut sub = hub.subscribe("resume", Some(10)).await.unwrap();
    let events = collect(&mut sub, 10).await;
    assert_eq!(sequences(&events), (11..=20).collect::<Vec<_>>());
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn test_latest_only_sees_new_events() {
    let (_log, hub) = setup(quiet_config());
    for i in 0..3 {
        hub.publish("latest", indexed(i)).await.unwrap();
    }

    let mut sub = hub.subscribe_at("latest", StartFrom::Latest).await.unwrap();
    hub.publish("latest", indexed(3)).await.unwrap();

    let event = next_event(&mut sub).await;
    assert_eq!(event.sequence, 4);
}

#[tokio::test]
async fn test_order_is_preserved_under_concurrent_publishing() {
    let (_log, hub) = setup(quiet_config());
    let mut sub = hub.subscribe("order", None).await.unwrap();

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let hub = hub.clone();
            tokio::spawn(async move {
                for i in 0..25 {
                    hub.publish("order", indexed(p * 100 + i)).await.unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    let events = collect(&mut sub, 100).await;
    assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert_eq!(events.last().map(|e| e.sequence), Some(100));
}

#[tokio::test]
async fn test_fan_out_delivers_every_event_to_every_subscriber() {
    let (_log, hub) = setup(quiet_config());
    let mut subs = Vec::new();
    for _ in 0..3 {
        subs.push(hub.subscribe("fan", None).await.unwrap());
    }
    assert_eq!(hub.get_subscriber_count("fan").await, 3);

    for i in 0..10 {
        hub.publish("fan", indexed(i)).await.unwrap();
    }

    // Drain the last subscriber first: consumption by one must not affect the others.
    for sub in subs.iter_mut().rev() {
        let events = collect(sub, 10).await;
        assert_eq!(sequences(&events), (1..=10).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn test_full_buffer_drops_oldest_and_counts_drops() {
    let (_log, hub) = setup(quiet_config().with_buffer_size(5));
    let mut sub = hub.subscribe("bp", None).await.unwrap();

    for i in 0..10 {
        hub.publish("bp", indexed(i)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let stats = tokio::time::timeout(WAIT, async {
        loop {
            let stats = hub.get_subscriber_stats("bp").await;
            if stats[0].last_sequence_sent == 10 {
                return stats[0];
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(stats.events_received, 10);
    assert_eq!(stats.events_dropped, 5);
    assert_eq!(stats.buffer_size, 5);
    assert!(stats.buffer_full);

    let retained: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
    assert_eq!(sequences(&retained), vec![6, 7, 8, 9, 10]);
}

#[tokio::test]
async fn test_only_persisted_events_reach_the_sink_in_order() {
    let log = Arc::new(MemoryLog::new());
    let sink = Arc::new(RecordingSink::default());
    let hub = EventHub::with_sink(log.clone(), sink.clone(), quiet_config());

    for i in 0..6 {
        let event = if i % 2 == 0 {
            NewEvent::persisted(indexed(i))
        } else {
            NewEvent::new(indexed(i))
        };
        hub.publish("persist", event).await.unwrap();
    }
    hub.close().await;

    let persisted = sink.events.lock().unwrap().clone();
    assert_eq!(sequences(&persisted), vec![1, 3, 5]);
    assert_eq!(log.info("persist").await.unwrap().unwrap().length, 6);
}

#[tokio::test]
async fn test_store_outage_is_surfaced_without_failing_publish() {
    let log = Arc::new(MemoryLog::new());
    let sink = Arc::new(RecordingSink::default());
    let hub = EventHub::with_sink(log.clone(), sink.clone(), quiet_config());
    let mut sub = hub.subscribe("outage", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    log.set_available(false);
    let sequence = hub
        .publish("outage", NewEvent::persisted(indexed(0)))
        .await
        .unwrap();
    assert_eq!(sequence, None);

    let event = next_event(&mut sub).await;
    assert_eq!(event.event_type(), "infrastructure_error");
    assert_eq!(event.sequence, UNSEQUENCED);
    assert_eq!(event.kind.data()["error_type"], "log_unavailable");
    assert_eq!(event.kind.data()["recoverable"], true);

    hub.close().await;
    let persisted = sink.events.lock().unwrap().clone();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].sequence, UNSEQUENCED);
}

#[tokio::test]
async fn test_idle_stream_emits_heartbeats() {
    let (_log, hub) = setup(HubConfig::default().with_block_ms(30));
    let mut sub = hub.subscribe("idle", None).await.unwrap();

    let event = next_event(&mut sub).await;
    assert_eq!(event.event_type(), "heartbeat");
    assert_eq!(event.sequence, UNSEQUENCED);
    assert_eq!(event.kind.data()["session_id"], "idle");
    assert_eq!(event.kind.data()["stream_position"], 0);
}

#[tokio::test]
async fn test_listener_gives_up_after_retry_limit() {
    let (log, hub) = setup(quiet_config().with_read_retry(2, 5));
    log.set_available(false);

    let mut sub = hub.subscribe("broken", None).await.unwrap();
    let event = next_event(&mut sub).await;
    assert_eq!(event.event_type(), "infrastructure_error");
    assert_eq!(event.kind.data()["error_type"], "log_read_failed");

    let end = tokio::time::timeout(WAIT, sub.recv()).await.unwrap();
    assert!(end.is_none());
}

#[tokio::test]
async fn test_listener_recovers_from_transient_read_errors() {
    let (log, hub) = setup(quiet_config().with_read_retry(10, 5));
    log.set_available(false);
    let mut sub = hub.subscribe("flaky", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    log.set_available(true);
    hub.publish("flaky", indexed(0)).await.unwrap();
    let event = next_event(&mut sub).await;
    assert_eq!(event.sequence, 1);
}

#[tokio::test]
async fn test_malformed_entries_are_skipped() {
    let (log, hub) = setup(quiet_config());
    log.append("bad", "{not json".to_string(), None).await.unwrap();
    hub.publish("bad", indexed(1)).await.unwrap();

    let mut sub = hub.subscribe("bad", None).await.unwrap();
    let event = next_event(&mut sub).await;
    assert_eq!(event.sequence, 2);

    let replay = hub.get_events_after("bad", 0, 10).await.unwrap();
    assert_eq!(sequences(&replay), vec![2]);
}

#[tokio::test]
async fn test_expired_checkpoint_yields_gap_marker() {
    let (_log, hub) = setup(quiet_config().with_max_stream_length(Some(5)));
    for i in 0..20 {
        hub.publish("gap", indexed(i)).await.unwrap();
    }

    let mut sub = hub.subscribe("gap", Some(3)).await.unwrap();
    let marker = next_event(&mut sub).await;
    assert_eq!(marker.event_type(), "stream_gap");
    assert_eq!(marker.kind.data()["requested_after"], 3);
    assert_eq!(marker.kind.data()["resumed_at"], 16);

    let events = collect(&mut sub, 5).await;
    assert_eq!(sequences(&events), vec![16, 17, 18, 19, 20]);
}

#[tokio::test]
async fn test_unsubscribe_stops_listener_and_ends_stream() {
    let (_log, hub) = setup(quiet_config());
    let mut sub = hub.subscribe("unsub", None).await.unwrap();
    assert_eq!(hub.get_subscriber_count("unsub").await, 1);

    assert!(hub.unsubscribe("unsub", sub.id()).await);
    assert_eq!(hub.get_subscriber_count("unsub").await, 0);
    assert!(hub.get_subscriber_stats("unsub").await.is_empty());
    assert!(sub.is_closed());

    hub.publish("unsub", indexed(0)).await.unwrap();
    assert!(sub.recv().await.is_none());
    assert!(!hub.unsubscribe("unsub", sub.id()).await);
}

#[tokio::test]
async fn test_dropped_subscription_is_removed() {
    let (_log, hub) = setup(quiet_config());
    let sub = hub.subscribe("dropped", None).await.unwrap();
    let kept = hub.subscribe("dropped", None).await.unwrap();
    assert_eq!(hub.get_subscriber_count("dropped").await, 2);

    drop(sub);
    tokio::time::timeout(WAIT, async {
        while hub.get_subscriber_count("dropped").await > 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("dropped subscriber was never removed");

    let stats = hub.get_subscriber_stats("dropped").await;
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].subscriber_id, kept.id());
}

#[tokio::test]
async fn test_live_subscriber_survives_stream_delete() {
    let (_log, hub) = setup(quiet_config());
    let mut sub = hub.subscribe("recycled", None).await.unwrap();
    for i in 0..3 {
        hub.publish("recycled", indexed(i)).await.unwrap();
    }
    assert_eq!(sequences(&collect(&mut sub, 3).await), vec![1, 2, 3]);

    assert!(hub.delete_stream("recycled").await.unwrap());
    let sequence = hub.publish("recycled", indexed(3)).await.unwrap();
    assert_eq!(sequence, Some(4));

    let event = collect(&mut sub, 1).await.remove(0);
    assert_eq!(event.sequence, 4);
    assert_eq!(event.kind.data()["index"], 3);

    // A client resuming from its old checkpoint still gets the new event.
    let mut resumed = hub.subscribe("recycled", Some(3)).await.unwrap();
    assert_eq!(sequences(&collect(&mut resumed, 1).await), vec![4]);
}

/// Log whose introspection is slow, to hold `Latest` resolution open.
struct SlowInfoLog(MemoryLog);

#[async_trait]
impl EventLog for SlowInfoLog {
    async fn append(
        &self,
        session_id: &str,
        body: String,
        max_len: Option<usize>,
    ) -> Result<i64, LogError> {
        self.0.append(session_id, body, max_len).await
    }

    async fn read_after(
        &self,
        session_id: &str,
        after: i64,
        limit: usize,
    ) -> Result<Vec<LogRecord>, LogError> {
        self.0.read_after(session_id, after, limit).await
    }

    async fn read_blocking(
        &self,
        session_id: &str,
        after: i64,
        limit: usize,
        block: Duration,
    ) -> Result<Vec<LogRecord>, LogError> {
        self.0.read_blocking(session_id, after, limit, block).await
    }

    async fn info(&self, session_id: &str) -> Result<Option<StreamInfo>, LogError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.0.info(session_id).await
    }

    async fn delete(&self, session_id: &str) -> Result<bool, LogError> {
        self.0.delete(session_id).await
    }
}

#[tokio::test]
async fn test_close_during_subscribe_leaves_no_subscriber() {
    let hub = EventHub::new(Arc::new(SlowInfoLog(MemoryLog::new())), quiet_config());

    let pending = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.subscribe_at("racing", StartFrom::Latest).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    hub.close().await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(HubError::Closed)));
    assert_eq!(hub.get_subscriber_count("racing").await, 0);
}

#[tokio::test]
async fn test_close_cancels_all_subscribers_and_rejects_new_work() {
    let (_log, hub) = setup(quiet_config());
    let mut a = hub.subscribe("a", None).await.unwrap();
    let mut b = hub.subscribe("b", None).await.unwrap();

    hub.close().await;
    hub.close().await;

    assert_eq!(hub.get_subscriber_count("a").await, 0);
    assert!(a.recv().await.is_none());
    assert!(b.recv().await.is_none());
    assert!(matches!(
        hub.publish("a", indexed(0)).await,
        Err(HubError::Closed)
    ));
    assert!(matches!(
        hub.subscribe("a", None).await,
        Err(HubError::Closed)
    ));
}

#[tokio::test]
async fn test_replay_and_introspection() {
    let (_log, hub) = setup(quiet_config());
    assert!(hub.stream_info("info").await.unwrap().is_none());
    for i in 0..8 {
        hub.publish("info", indexed(i)).await.unwrap();
    }

    let info = hub.stream_info("info").await.unwrap().unwrap();
    assert_eq!((info.length, info.first_sequence, info.last_sequence), (8, 1, 8));

    let page = hub.get_events_after("info", 2, 3).await.unwrap();
    assert_eq!(sequences(&page), vec![3, 4, 5]);

    assert!(hub.delete_stream("info").await.unwrap());
    assert!(hub.stream_info("info").await.unwrap().is_none());
}

#[tokio::test]
async fn test_publish_event_decodes_known_types() {
    let (_log, hub) = setup(quiet_config());
    hub.publish_event("typed", "status_change", &json!({"status": "running"}), false)
        .await
        .unwrap();
    hub.publish_event("typed", "progress", &0.5, false)
        .await
        .unwrap();

    let events = hub.get_events_after("typed", 0, 10).await.unwrap();
    assert!(matches!(events[0].kind, EventKind::StatusChange(_)));
    assert_eq!(events[1].event_type(), "progress");
    assert_eq!(events[1].kind.data()["value"], 0.5);
}

#[tokio::test]
async fn test_empty_session_id_is_rejected() {
    let (_log, hub) = setup(quiet_config());
    assert!(matches!(
        hub.publish("", indexed(0)).await,
        Err(HubError::InvalidSessionId(_))
    ));
    assert!(matches!(
        hub.subscribe("  ", None).await,
        Err(HubError::InvalidSessionId(_))
    ));
}
