//! Registry scenarios against the in-memory broker
//!
//! These tests drive the full start → consume → stop → restore cycle:
//! - Idempotent start
//! - Storage of JSON and non-JSON bodies
//! - Graceful stop leaves later messages on the broker
//! - Reconnect after broker failures
//! - Restore of persisted consumers after a restart

use amqp_consumer::*;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use test_utils::TestDataBuilder;

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

struct Fixture {
    broker: InMemoryBroker,
    snapshots: Arc<MemorySnapshotStore>,
    registry: Arc<ConsumerRegistry>,
}

fn fixture_with(broker: InMemoryBroker, snapshots: Arc<MemorySnapshotStore>) -> Fixture {
    let state = Arc::new(ConsumerState::new(
        PersistenceGateway::new(snapshots.clone()),
        PersistMode::EveryMutation,
    ));
    let config = WorkerConfig::new().with_backoff(Backoff::fixed(Duration::from_millis(10)));
    let registry = Arc::new(ConsumerRegistry::new(
        Arc::new(broker.clone()),
        state,
        config,
    ));
    Fixture {
        broker,
        snapshots,
        registry,
    }
}

fn fixture() -> Fixture {
    fixture_with(InMemoryBroker::new(), Arc::new(MemorySnapshotStore::new()))
}

impl Fixture {
    async fn wait_consuming(&self, queue: &str) {
        let registry = self.registry.clone();
        let queue = queue.to_string();
        eventually("worker consuming", || {
            let registry = registry.clone();
            let queue = queue.clone();
            async move { registry.worker_state(&queue).unwrap() == Some(WorkerState::Consuming) }
        })
        .await;
    }

    async fn wait_count(&self, queue: &str, count: usize) {
        let registry = self.registry.clone();
        let queue = queue.to_string();
        eventually("stored message count", || {
            let registry = registry.clone();
            let queue = queue.clone();
            async move { registry.messages(&queue).unwrap().count == count }
        })
        .await;
    }

    async fn publish(&self, queue: &str, body: &[u8]) {
        self.broker.publish("", queue, body).await.unwrap();
    }
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let f = fixture();
    let queue = TestDataBuilder::from_test_name("start_idempotent").queue("orders");

    assert_eq!(f.registry.start(&queue).unwrap(), StartOutcome::Started);
    assert_eq!(f.registry.start(&queue).unwrap(), StartOutcome::AlreadyActive);

    assert_eq!(f.registry.list_active().unwrap(), vec![queue.clone()]);
    assert_eq!(f.registry.spawned_workers(), 1);

    f.wait_consuming(&queue).await;
    assert_eq!(f.broker.consumer_count(&queue), 1);
}

#[tokio::test]
async fn test_start_rejects_empty_queue_name() {
    let f = fixture();
    let err = f.registry.start("").unwrap_err();
    assert!(matches!(err, ConsumerError::InvalidRequest(_)));
    assert!(f.registry.list_active().unwrap().is_empty());
    assert_eq!(f.registry.spawned_workers(), 0);
}

#[tokio::test]
async fn test_messages_for_unknown_queue_are_empty() {
    let f = fixture();
    let messages = f.registry.messages("never-started").unwrap();
    assert_eq!(messages.count, 0);
    assert!(messages.messages.is_empty());
}

#[tokio::test]
async fn test_json_message_is_stored() {
    let f = fixture();
    f.registry.start("orders").unwrap();
    f.wait_consuming("orders").await;

    f.publish("orders", br#"{"id":1}"#).await;
    f.wait_count("orders", 1).await;

    let stored = f.registry.messages("orders").unwrap();
    assert_eq!(stored.messages[0].content, json!({"id": 1}));
    assert!(stored.messages[0].received_at_epoch > 0.0);
    assert_eq!(stored.messages[0].received_at_formatted.len(), 19);
}

#[tokio::test]
async fn test_non_json_message_is_stored_as_text_and_acked() {
    let f = fixture();
    f.registry.start("logs").unwrap();
    f.wait_consuming("logs").await;

    f.publish("logs", b"disk almost full").await;
    f.wait_count("logs", 1).await;

    assert_eq!(
        f.registry.messages("logs").unwrap().messages[0].content,
        json!("disk almost full")
    );
    let broker = f.broker.clone();
    eventually("ack", || {
        let broker = broker.clone();
        async move { broker.acked("logs").len() == 1 }
    })
    .await;
}

#[tokio::test]
async fn test_fifo_order_within_queue() {
    let f = fixture();
    let builder = TestDataBuilder::from_test_name("fifo");
    f.registry.start("orders").unwrap();
    f.wait_consuming("orders").await;

    for n in 1..=10 {
        f.publish("orders", builder.payload(n).to_string().as_bytes()).await;
    }
    f.wait_count("orders", 10).await;

    let ids: Vec<u64> = f
        .registry
        .messages("orders")
        .unwrap()
        .messages
        .iter()
        .map(|e| e.content["id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, (1..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_clear_keeps_consumer_active() {
    let f = fixture();
    f.registry.start("orders").unwrap();
    f.wait_consuming("orders").await;
    f.publish("orders", b"1").await;
    f.publish("orders", b"2").await;
    f.wait_count("orders", 2).await;

    f.registry.clear("orders").unwrap();
    assert_eq!(f.registry.messages("orders").unwrap().count, 0);
    assert_eq!(f.registry.list_active().unwrap(), vec!["orders"]);

    f.publish("orders", b"3").await;
    f.wait_count("orders", 1).await;
}

#[tokio::test]
async fn test_clear_unknown_queue_is_noop() {
    let f = fixture();
    f.registry.clear("unknown").unwrap();
    assert_eq!(f.registry.messages("unknown").unwrap().count, 0);
}

#[tokio::test]
async fn test_stop_prevents_further_storage() {
    let f = fixture();
    f.registry.start("orders").unwrap();
    f.wait_consuming("orders").await;
    f.publish("orders", br#"{"id":1}"#).await;
    f.wait_count("orders", 1).await;

    assert_eq!(f.registry.stop("orders").unwrap(), StopOutcome::Stopped);
    assert!(f.registry.list_active().unwrap().is_empty());
    assert_eq!(f.registry.worker_state("orders").unwrap(), None);

    let broker = f.broker.clone();
    eventually("subscription cancelled", || {
        let broker = broker.clone();
        async move { broker.consumer_count("orders") == 0 }
    })
    .await;

    f.publish("orders", br#"{"id":2}"#).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(f.registry.messages("orders").unwrap().count, 1);
    assert_eq!(f.broker.ready_count("orders"), 1);
}

#[tokio::test]
async fn test_stop_unknown_queue() {
    let f = fixture();
    assert_eq!(f.registry.stop("orders").unwrap(), StopOutcome::NotFound);
}

#[tokio::test]
async fn test_start_stop_start_does_not_leak_workers() {
    let f = fixture();
    for _ in 0..3 {
        f.registry.start("orders").unwrap();
        f.wait_consuming("orders").await;
        f.registry.stop("orders").unwrap();
    }
    f.registry.start("orders").unwrap();
    f.wait_consuming("orders").await;

    let broker = f.broker.clone();
    eventually("single consumer", || {
        let broker = broker.clone();
        async move { broker.consumer_count("orders") == 1 }
    })
    .await;
    assert_eq!(f.registry.spawned_workers(), 4);

    f.publish("orders", b"once").await;
    f.wait_count("orders", 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(f.registry.messages("orders").unwrap().count, 1);
}

#[tokio::test]
async fn test_reconnects_after_subscribe_failures() {
    let broker = InMemoryBroker::new();
    broker.fail_next_subscribes(3);
    let f = fixture_with(broker, Arc::new(MemorySnapshotStore::new()));

    f.registry.start("orders").unwrap();
    f.wait_consuming("orders").await;
    assert_eq!(f.broker.subscribe_attempts("orders"), 4);

    f.publish("orders", b"after recovery").await;
    f.wait_count("orders", 1).await;
}

#[tokio::test]
async fn test_recovers_from_broker_outage() {
    let f = fixture();
    f.registry.start("orders").unwrap();
    f.wait_consuming("orders").await;

    f.broker.set_unavailable(true);
    let registry = f.registry.clone();
    eventually("worker failed", || {
        let registry = registry.clone();
        async move { registry.worker_state("orders").unwrap() == Some(WorkerState::Failed) }
    })
    .await;

    f.broker.set_unavailable(false);
    f.wait_consuming("orders").await;
    f.publish("orders", b"back").await;
    f.wait_count("orders", 1).await;
}

#[tokio::test]
async fn test_persistence_failure_still_acks() {
    let snapshots = Arc::new(MemorySnapshotStore::new());
    let f = fixture_with(InMemoryBroker::new(), snapshots.clone());
    f.registry.start("orders").unwrap();
    f.wait_consuming("orders").await;

    snapshots.set_fail_writes(true);
    f.publish("orders", br#"{"id":1}"#).await;
    f.wait_count("orders", 1).await;

    let broker = f.broker.clone();
    eventually("ack despite failed snapshot", || {
        let broker = broker.clone();
        async move { broker.acked("orders").len() == 1 }
    })
    .await;

    let persisted: serde_json::Value =
        serde_json::from_slice(&f.snapshots.raw(Artifact::Messages).unwrap()).unwrap();
    assert_eq!(persisted, json!({"orders": []}));
}

#[tokio::test]
async fn test_restore_respawns_persisted_consumers() {
    let snapshots = Arc::new(MemorySnapshotStore::new());
    let broker = InMemoryBroker::new();

    {
        let f = fixture_with(broker.clone(), snapshots.clone());
        f.registry.start("orders").unwrap();
        f.registry.start("payments").unwrap();
        f.wait_consuming("orders").await;
        f.publish("orders", br#"{"id":1}"#).await;
        f.wait_count("orders", 1).await;
        f.registry.shutdown().await;
    }
    assert_eq!(broker.consumer_count("orders"), 0);

    let f = fixture_with(broker, snapshots);
    assert!(!f.registry.is_restored());
    let restored = f.registry.restore().unwrap();
    assert!(f.registry.is_restored());

    assert_eq!(restored, vec!["orders", "payments"]);
    assert_eq!(f.registry.messages("orders").unwrap().count, 1);
    assert_eq!(f.registry.spawned_workers(), 2);

    f.wait_consuming("orders").await;
    f.wait_consuming("payments").await;
    f.publish("payments", br#"{"amount":10}"#).await;
    f.wait_count("payments", 1).await;
}

#[tokio::test]
async fn test_restore_from_corrupt_snapshot_starts_empty() {
    let snapshots = Arc::new(MemorySnapshotStore::new());
    snapshots.insert_raw(Artifact::ActiveQueues, "not json at all");
    snapshots.insert_raw(Artifact::Messages, "{\"orders\": [");
    let f = fixture_with(InMemoryBroker::new(), snapshots);

    assert!(f.registry.restore().unwrap().is_empty());
    assert_eq!(f.registry.spawned_workers(), 0);
}

#[tokio::test]
async fn test_restore_drops_invalid_persisted_names() {
    let snapshots = Arc::new(MemorySnapshotStore::new());
    snapshots.insert_raw(Artifact::ActiveQueues, r#"["", "orders"]"#);
    let f = fixture_with(InMemoryBroker::new(), snapshots);

    assert_eq!(f.registry.restore().unwrap(), vec!["orders"]);
    assert_eq!(f.registry.list_active().unwrap(), vec!["orders"]);
    assert_eq!(f.registry.spawned_workers(), 1);
    let states = f.registry.worker_states().unwrap();
    assert_eq!(states.keys().collect::<Vec<_>>(), vec!["orders"]);

    let persisted: Vec<String> =
        serde_json::from_slice(&f.snapshots.raw(Artifact::ActiveQueues).unwrap()).unwrap();
    assert_eq!(persisted, vec!["orders"]);

    f.registry.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_keeps_active_queues_persisted() {
    let f = fixture();
    f.registry.start("orders").unwrap();
    f.wait_consuming("orders").await;

    f.registry.shutdown().await;

    let persisted: Vec<String> =
        serde_json::from_slice(&f.snapshots.raw(Artifact::ActiveQueues).unwrap()).unwrap();
    assert_eq!(persisted, vec!["orders"]);
    assert_eq!(f.broker.consumer_count("orders"), 0);
}

#[tokio::test]
async fn test_interval_mode_flushes_on_shutdown() {
    let snapshots = Arc::new(MemorySnapshotStore::new());
    let broker = InMemoryBroker::new();
    let state = Arc::new(ConsumerState::new(
        PersistenceGateway::new(snapshots.clone()),
        PersistMode::Interval(Duration::from_secs(3600)),
    ));
    let registry = ConsumerRegistry::new(Arc::new(broker.clone()), state, WorkerConfig::new());

    registry.start("orders").unwrap();
    assert!(snapshots.raw(Artifact::ActiveQueues).is_none());

    registry.shutdown().await;
    let persisted: Vec<String> =
        serde_json::from_slice(&snapshots.raw(Artifact::ActiveQueues).unwrap()).unwrap();
    assert_eq!(persisted, vec!["orders"]);
}

#[tokio::test]
async fn test_worker_states_listing() {
    let f = fixture();
    f.registry.start("a").unwrap();
    f.registry.start("b").unwrap();
    f.wait_consuming("a").await;
    f.wait_consuming("b").await;

    let states = f.registry.worker_states().unwrap();
    assert_eq!(states.len(), 2);
    assert!(states.values().all(|s| *s == WorkerState::Consuming));
}
