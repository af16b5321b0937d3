//! Per-queue consumer worker.
//!
//! A worker owns one subscription at a time and moves through:
//!
//! ```text
//!            ┌──────────── backoff elapsed ─────────────┐
//!            v                                          │
//!     ┌────────────┐  subscribed  ┌───────────┐  error ┌────────┐
//!     │ CONNECTING │ ───────────> │ CONSUMING │ ─────> │ FAILED │
//!     └────────────┘              └───────────┘        └────────┘
//!            │ subscribe error                              ^
//!            └──────────────────────────────────────────────┘
//!
//!     cancellation from any state ──> STOPPED
//! ```
//!
//! Every delivery is decoded, stored, and then acknowledged, whether or not
//! storing succeeded. Cancellation is observed before each subscribe, during
//! backoff, and between deliveries; a delivery already being handled is
//! finished before the subscription is cancelled.

use crate::broker::{Broker, Delivery, SubscribeOptions, Subscription};
use crate::config::WorkerConfig;
use crate::envelope::{BodyEncoding, MessageEnvelope, decode_body};
use crate::error::ConsumerError;
use crate::metrics::ConsumerMetrics;
use crate::state::ConsumerState;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::{AsRefStr, Display};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How long a cancelled worker waits for an in-progress subscribe to finish.
const SUBSCRIBE_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

type SubscribeFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Box<dyn Subscription>, ConsumerError>> + Send + 'a>>;

/// Lifecycle state of a consumer worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Connecting,
    Consuming,
    Failed,
    Stopped,
}

/// Resolves once cancellation is requested or the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|stop| *stop).await;
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow() || cancel.has_changed().is_err()
}

enum Next {
    Cancelled,
    Delivery(Option<Result<Delivery, ConsumerError>>),
}

/// Consumes one queue until cancelled.
pub struct ConsumerWorker {
    queue: String,
    broker: Arc<dyn Broker>,
    state: Arc<ConsumerState>,
    config: WorkerConfig,
    metrics: ConsumerMetrics,
    status: watch::Sender<WorkerState>,
}

impl ConsumerWorker {
    /// Create a worker and a receiver that follows its state.
    pub fn new(
        queue: impl Into<String>,
        broker: Arc<dyn Broker>,
        state: Arc<ConsumerState>,
        config: WorkerConfig,
    ) -> (Self, watch::Receiver<WorkerState>) {
        let queue = queue.into();
        let (status, status_rx) = watch::channel(WorkerState::Connecting);
        let worker = Self {
            metrics: ConsumerMetrics::new(&queue),
            queue,
            broker,
            state,
            config,
            status,
        };
        (worker, status_rx)
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    fn set_state(&self, state: WorkerState) {
        let previous = self.status.send_replace(state);
        if previous != state {
            debug!(queue = %self.queue, from = %previous, to = %state, "Worker state changed");
        }
    }

    /// Run until `cancel` becomes true or its sender is dropped.
    pub async fn run(self, mut cancel: watch::Receiver<bool>) {
        info!(queue = %self.queue, broker = %self.broker.describe(), "Starting consumer worker");
        self.metrics.worker_started();

        let mut failures: u32 = 0;
        let mut subscriptions: u64 = 0;

        loop {
            if is_cancelled(&cancel) {
                break;
            }

            self.set_state(WorkerState::Connecting);
            subscriptions += 1;
            let options = SubscribeOptions {
                prefetch: self.config.prefetch,
                consumer_tag: self.config.consumer_tag(&self.queue, subscriptions),
            };

            let mut subscribe = self.broker.subscribe(&self.queue, &options);
            let subscribed = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => {
                    self.settle_subscribe(subscribe).await;
                    break;
                }
                result = &mut subscribe => result,
            };

            let failure = match subscribed {
                Ok(subscription) => {
                    if failures > 0 {
                        info!(queue = %self.queue, failures, "Reconnected to broker");
                    }
                    failures = 0;
                    self.set_state(WorkerState::Consuming);
                    info!(queue = %self.queue, "Started consuming from queue");

                    match self.consume(subscription, &mut cancel).await {
                        Ok(()) => break,
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            failures = failures.saturating_add(1);
            self.set_state(WorkerState::Failed);
            self.metrics.connection_failed();
            let delay = self.config.backoff.delay(failures);
            if failure.is_connection_error() {
                warn!(
                    queue = %self.queue,
                    error = %failure,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    "Error in consumer, reconnecting after backoff"
                );
            } else {
                error!(
                    queue = %self.queue,
                    error = %failure,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    "Unexpected consumer error, retrying after backoff"
                );
            }

            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(WorkerState::Stopped);
        self.metrics.worker_stopped();
        info!(queue = %self.queue, "Consumer worker stopped");
    }

    /// Let a subscribe interrupted by cancellation finish, then cancel what it
    /// opened. Gives up after [`SUBSCRIBE_SETTLE_TIMEOUT`].
    async fn settle_subscribe(&self, subscribe: SubscribeFuture<'_>) {
        match tokio::time::timeout(SUBSCRIBE_SETTLE_TIMEOUT, subscribe).await {
            Ok(Ok(subscription)) => {
                if let Err(e) = subscription.cancel().await {
                    debug!(queue = %self.queue, error = %e, "Failed to cancel late subscription");
                }
            }
            Ok(Err(e)) => {
                debug!(queue = %self.queue, error = %e, "Subscribe failed after cancellation");
            }
            Err(_) => {
                warn!(queue = %self.queue, "Subscribe did not settle after cancellation, abandoning it");
            }
        }
    }

    /// Pull deliveries until cancelled (`Ok`) or the subscription fails (`Err`).
    async fn consume(
        &self,
        mut subscription: Box<dyn Subscription>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), ConsumerError> {
        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = cancelled(cancel) => Next::Cancelled,
                next = subscription.next_delivery() => Next::Delivery(next),
            };

            match next {
                Next::Cancelled => break Ok(()),
                Next::Delivery(None) => break Err(ConsumerError::SubscriptionClosed),
                Next::Delivery(Some(Err(e))) => break Err(e),
                Next::Delivery(Some(Ok(delivery))) => {
                    if let Err(e) = self.handle_delivery(subscription.as_mut(), delivery).await {
                        break Err(e);
                    }
                }
            }
        };

        // Also releases the connection of a subscription that already failed.
        debug!(queue = %self.queue, "Cancelling subscription");
        if let Err(e) = subscription.cancel().await {
            if outcome.is_ok() {
                warn!(queue = %self.queue, error = %e, "Failed to cancel subscription cleanly");
            } else {
                debug!(queue = %self.queue, error = %e, "Cancel after failure did not complete");
            }
        }
        outcome
    }

    /// Store one delivery, then acknowledge it unconditionally.
    async fn handle_delivery(
        &self,
        subscription: &mut dyn Subscription,
        delivery: Delivery,
    ) -> Result<(), ConsumerError> {
        let started = Instant::now();
        let delivery_tag = delivery.delivery_tag;
        debug!(
            queue = %self.queue,
            delivery_tag,
            redelivered = delivery.redelivered,
            "Received message"
        );

        if let Err(e) = self.store(&delivery) {
            self.metrics.processing_failed();
            error!(queue = %self.queue, delivery_tag, error = %e, "Error processing message");
        }

        match subscription.ack(delivery_tag).await {
            Ok(()) => {
                self.metrics.ack(true);
                self.metrics.message_handled(started.elapsed());
                debug!(queue = %self.queue, delivery_tag, "Message acknowledged");
                Ok(())
            }
            Err(e) => {
                self.metrics.ack(false);
                Err(e)
            }
        }
    }

    fn store(&self, delivery: &Delivery) -> Result<usize, ConsumerError> {
        let (content, encoding) = decode_body(&delivery.body);
        self.metrics.message_received(encoding);
        if encoding == BodyEncoding::Text {
            debug!(queue = %self.queue, "Message body is not JSON, storing as text");
        }
        self.state
            .append(&self.queue, MessageEnvelope::received_now(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::QueueBinder;
    use crate::config::PersistMode;
    use crate::error::PersistenceError;
    use crate::memory::InMemoryBroker;
    use crate::persistence::{Artifact, MemorySnapshotStore, PersistenceGateway, SnapshotStore};
    use crate::resilience::Backoff;
    use serde_json::json;
    use std::sync::{Mutex, mpsc};
    use tokio::task::JoinHandle;

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    struct Harness {
        broker: InMemoryBroker,
        state: Arc<ConsumerState>,
        status: watch::Receiver<WorkerState>,
        cancel: watch::Sender<bool>,
        task: JoinHandle<()>,
    }

    fn spawn(queue: &str, broker: InMemoryBroker) -> Harness {
        let state = Arc::new(ConsumerState::new(
            PersistenceGateway::memory(),
            PersistMode::EveryMutation,
        ));
        let config = WorkerConfig::new().with_backoff(Backoff::fixed(Duration::from_millis(10)));
        let (worker, status) =
            ConsumerWorker::new(queue, Arc::new(broker.clone()), state.clone(), config);
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(worker.run(cancel_rx));
        Harness {
            broker,
            state,
            status,
            cancel,
            task,
        }
    }

    async fn wait_for_state(status: &mut watch::Receiver<WorkerState>, wanted: WorkerState) {
        tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| *s == wanted))
            .await
            .expect("worker did not reach state")
            .expect("worker status channel closed");
    }

    #[tokio::test]
    async fn test_stores_and_acks_json() {
        let mut h = spawn("orders", InMemoryBroker::new());
        wait_for_state(&mut h.status, WorkerState::Consuming).await;

        h.broker.publish("", "orders", br#"{"id":1}"#).await.unwrap();

        let state = h.state.clone();
        eventually(|| {
            let state = state.clone();
            async move { state.messages("orders").unwrap().count == 1 }
        })
        .await;
        assert_eq!(h.state.messages("orders").unwrap().messages[0].content, json!({"id": 1}));

        let broker = h.broker.clone();
        eventually(|| {
            let broker = broker.clone();
            async move { broker.acked("orders").len() == 1 }
        })
        .await;
    }

    #[tokio::test]
    async fn test_non_json_is_stored_as_text_and_acked() {
        let mut h = spawn("logs", InMemoryBroker::new());
        wait_for_state(&mut h.status, WorkerState::Consuming).await;

        h.broker.publish("", "logs", b"plain text line").await.unwrap();

        let broker = h.broker.clone();
        eventually(|| {
            let broker = broker.clone();
            async move { broker.acked("logs").len() == 1 }
        })
        .await;
        assert_eq!(
            h.state.messages("logs").unwrap().messages[0].content,
            json!("plain text line")
        );
    }

    #[tokio::test]
    async fn test_preserves_delivery_order() {
        let mut h = spawn("orders", InMemoryBroker::new());
        wait_for_state(&mut h.status, WorkerState::Consuming).await;

        for n in 1..=5 {
            h.broker
                .publish("", "orders", json!({"n": n}).to_string().as_bytes())
                .await
                .unwrap();
        }

        let state = h.state.clone();
        eventually(|| {
            let state = state.clone();
            async move { state.messages("orders").unwrap().count == 5 }
        })
        .await;
        let order: Vec<_> = h
            .state
            .messages("orders")
            .unwrap()
            .messages
            .iter()
            .map(|e| e.content["n"].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_retries_failed_subscribes() {
        let broker = InMemoryBroker::new();
        broker.fail_next_subscribes(3);
        let mut h = spawn("orders", broker);

        wait_for_state(&mut h.status, WorkerState::Consuming).await;
        assert_eq!(h.broker.subscribe_attempts("orders"), 4);
    }

    #[tokio::test]
    async fn test_resubscribes_when_stream_closes() {
        let mut h = spawn("orders", InMemoryBroker::new());
        wait_for_state(&mut h.status, WorkerState::Consuming).await;

        h.broker.close_subscriptions();

        let broker = h.broker.clone();
        eventually(|| {
            let broker = broker.clone();
            async move { broker.subscribe_attempts("orders") >= 2 && broker.consumer_count("orders") == 1 }
        })
        .await;
        wait_for_state(&mut h.status, WorkerState::Consuming).await;

        h.broker.publish("", "orders", b"after reconnect").await.unwrap();
        let state = h.state.clone();
        eventually(|| {
            let state = state.clone();
            async move { state.messages("orders").unwrap().count == 1 }
        })
        .await;
    }

    #[tokio::test]
    async fn test_ack_failure_triggers_reconnect() {
        let broker = InMemoryBroker::new();
        broker.fail_next_acks(1);
        let mut h = spawn("orders", broker);
        wait_for_state(&mut h.status, WorkerState::Consuming).await;

        h.broker.publish("", "orders", br#"{"id":9}"#).await.unwrap();

        let broker = h.broker.clone();
        eventually(|| {
            let broker = broker.clone();
            async move { broker.acked("orders").len() == 1 }
        })
        .await;
        assert!(h.broker.subscribe_attempts("orders") >= 2);
        // The unacknowledged delivery is redelivered and stored again.
        assert_eq!(h.state.messages("orders").unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_stops_promptly() {
        let broker = InMemoryBroker::new();
        broker.set_unavailable(true);
        let state = Arc::new(ConsumerState::new(
            PersistenceGateway::memory(),
            PersistMode::EveryMutation,
        ));
        let config = WorkerConfig::new().with_backoff(Backoff::fixed(Duration::from_secs(60)));
        let (worker, mut status) =
            ConsumerWorker::new("orders", Arc::new(broker.clone()), state, config);
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(worker.run(cancel_rx));

        wait_for_state(&mut status, WorkerState::Failed).await;
        cancel.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("worker ignored cancellation during backoff")
            .unwrap();
        assert_eq!(*status.borrow(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_cancel_stops_consuming() {
        let mut h = spawn("orders", InMemoryBroker::new());
        wait_for_state(&mut h.status, WorkerState::Consuming).await;

        h.cancel.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), h.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*h.status.borrow(), WorkerState::Stopped);
        assert_eq!(h.broker.consumer_count("orders"), 0);

        h.broker.publish("", "orders", b"after stop").await.unwrap();
        assert_eq!(h.broker.ready_count("orders"), 1);
        assert_eq!(h.state.messages("orders").unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_dropped_sender_cancels() {
        let mut h = spawn("orders", InMemoryBroker::new());
        wait_for_state(&mut h.status, WorkerState::Consuming).await;

        drop(h.cancel);
        tokio::time::timeout(Duration::from_secs(1), h.task)
            .await
            .unwrap()
            .unwrap();
    }

    /// Holds the first message-history write until released.
    struct GatedStore {
        inner: MemorySnapshotStore,
        entered: Mutex<Option<mpsc::Sender<()>>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl SnapshotStore for GatedStore {
        fn write(&self, artifact: Artifact, bytes: &[u8]) -> Result<(), PersistenceError> {
            if artifact == Artifact::Messages {
                if let Some(entered) = self.entered.lock().unwrap().take() {
                    let _ = entered.send(());
                    let _ = self
                        .release
                        .lock()
                        .unwrap()
                        .recv_timeout(Duration::from_secs(5));
                }
            }
            self.inner.write(artifact, bytes)
        }

        fn read(&self, artifact: Artifact) -> Result<Option<Vec<u8>>, PersistenceError> {
            self.inner.read(artifact)
        }

        fn location(&self) -> String {
            "gated".to_string()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_mid_delivery_stores_and_acks_first() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let store = Arc::new(GatedStore {
            inner: MemorySnapshotStore::new(),
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(release_rx),
        });
        let state = Arc::new(ConsumerState::new(
            PersistenceGateway::new(store),
            PersistMode::EveryMutation,
        ));
        let broker = InMemoryBroker::new();
        let config = WorkerConfig::new().with_backoff(Backoff::fixed(Duration::from_millis(10)));
        let (worker, mut status) =
            ConsumerWorker::new("orders", Arc::new(broker.clone()), state.clone(), config);
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(worker.run(cancel_rx));
        wait_for_state(&mut status, WorkerState::Consuming).await;

        broker.publish("", "orders", br#"{"id":1}"#).await.unwrap();
        tokio::task::spawn_blocking(move || entered_rx.recv_timeout(Duration::from_secs(2)))
            .await
            .unwrap()
            .expect("delivery never reached the store");

        // Cancel while the delivery is still being stored
        cancel.send(true).unwrap();
        release_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("worker did not stop")
            .unwrap();
        assert_eq!(*status.borrow(), WorkerState::Stopped);
        assert_eq!(state.messages("orders").unwrap().messages[0].content, json!({"id": 1}));
        assert_eq!(state.messages("orders").unwrap().count, 1);
        assert_eq!(broker.acked("orders").len(), 1);
        assert_eq!(broker.ready_count("orders"), 0);
        assert_eq!(broker.consumer_count("orders"), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_subscribing_releases_subscription() {
        let broker = InMemoryBroker::new();
        broker.delay_next_subscribe(Duration::from_millis(200));
        let mut h = spawn("orders", broker);

        let broker = h.broker.clone();
        eventually(|| {
            let broker = broker.clone();
            async move { broker.consumer_count("orders") == 1 }
        })
        .await;
        assert_eq!(*h.status.borrow(), WorkerState::Connecting);

        h.cancel.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), h.task)
            .await
            .expect("worker did not stop")
            .unwrap();

        wait_for_state(&mut h.status, WorkerState::Stopped).await;
        assert_eq!(h.broker.consumer_count("orders"), 0);
        assert_eq!(h.broker.subscribe_attempts("orders"), 1);
    }

    #[test]
    fn test_worker_state_names() {
        assert_eq!(WorkerState::Consuming.to_string(), "consuming");
        assert_eq!(
            serde_json::to_value(WorkerState::Failed).unwrap(),
            json!("failed")
        );
    }
}
