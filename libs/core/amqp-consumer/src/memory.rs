//! In-process broker for tests and local runs.
//!
//! Models the parts of AMQP the consumer depends on: durable queues, the
//! default exchange, direct/fanout/topic routing, prefetch, acknowledgement,
//! and requeue of unacknowledged deliveries when a consumer goes away. Fault
//! injection hooks let tests drive the worker through its failure paths.

use crate::broker::{
    Broker, Delivery, ExchangeKind, QueueBinder, SubscribeOptions, Subscription,
};
use crate::error::ConsumerError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<(Vec<u8>, bool)>,
    acked: Vec<Vec<u8>>,
    consumers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

#[derive(Debug, Default)]
struct Inner {
    queues: BTreeMap<String, QueueState>,
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<Binding>,
    next_tag: u64,
    generation: u64,
    unavailable: bool,
    failing_subscribes: u32,
    failing_acks: u32,
    subscribe_delay: Option<Duration>,
    subscribe_attempts: HashMap<String, u64>,
}

impl Inner {
    fn check_available(&self) -> Result<(), ConsumerError> {
        if self.unavailable {
            return Err(ConsumerError::Unavailable("in-memory broker is down".to_string()));
        }
        Ok(())
    }

    fn route(&mut self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<usize, ConsumerError> {
        let targets: Vec<String> = if exchange.is_empty() {
            if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let kind = *self.exchanges.get(exchange).ok_or_else(|| {
                ConsumerError::Unavailable(format!("NOT_FOUND - no exchange '{exchange}'"))
            })?;
            let mut targets: Vec<String> = self
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange)
                .filter(|b| match kind {
                    ExchangeKind::Direct => b.routing_key == routing_key,
                    ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
                    // Binding arguments are not modelled, so every binding matches.
                    ExchangeKind::Fanout | ExchangeKind::Headers => true,
                })
                .map(|b| b.queue.clone())
                .collect();
            targets.sort();
            targets.dedup();
            targets
        };

        for queue in &targets {
            if let Some(state) = self.queues.get_mut(queue) {
                state.ready.push_back((body.to_vec(), false));
            }
        }
        Ok(targets.len())
    }
}

/// Match a topic binding pattern (`*` one word, `#` zero or more) against a key.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if key.is_empty() { Vec::new() } else { key.split('.').collect() };
    matches(&pattern, &key)
}

/// Broker that lives entirely in process memory.
///
/// Cloning yields another handle to the same broker.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, ConsumerError> {
        self.inner
            .lock()
            .map_err(|_| ConsumerError::Unavailable("in-memory broker lock poisoned".to_string()))
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> Option<T> {
        self.inner.lock().ok().map(|mut inner| f(&mut inner))
    }

    /// Fail every operation until turned off again.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.with_inner(|inner| inner.unavailable = unavailable);
        self.notify.notify_waiters();
    }

    /// Fail the next `count` subscribe calls.
    pub fn fail_next_subscribes(&self, count: u32) {
        self.with_inner(|inner| inner.failing_subscribes = count);
    }

    /// Fail the next `count` acknowledgements.
    pub fn fail_next_acks(&self, count: u32) {
        self.with_inner(|inner| inner.failing_acks = count);
    }

    /// Hold the next subscribe for `delay` after the consumer is registered.
    ///
    /// A caller that abandons the call during the delay leaves the consumer
    /// registered, the way a dropped client leaves its connection open.
    pub fn delay_next_subscribe(&self, delay: Duration) {
        self.with_inner(|inner| inner.subscribe_delay = Some(delay));
    }

    /// End every open subscription as if the broker closed the channel.
    pub fn close_subscriptions(&self) {
        self.with_inner(|inner| inner.generation += 1);
        self.notify.notify_waiters();
    }

    /// Messages waiting on `queue`, not yet delivered.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.with_inner(|inner| inner.queues.get(queue).map_or(0, |q| q.ready.len()))
            .unwrap_or(0)
    }

    /// Bodies acknowledged on `queue`, in ack order.
    pub fn acked(&self, queue: &str) -> Vec<Vec<u8>> {
        self.with_inner(|inner| {
            inner
                .queues
                .get(queue)
                .map(|q| q.acked.clone())
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }

    /// Open subscriptions on `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.with_inner(|inner| inner.queues.get(queue).map_or(0, |q| q.consumers))
            .unwrap_or(0)
    }

    /// Subscribe calls made for `queue`, failed ones included.
    pub fn subscribe_attempts(&self, queue: &str) -> u64 {
        self.with_inner(|inner| inner.subscribe_attempts.get(queue).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.with_inner(|inner| inner.queues.contains_key(queue))
            .unwrap_or(false)
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.with_inner(|inner| inner.exchanges.get(exchange).copied())
            .flatten()
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.with_inner(|inner| inner.bindings.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn subscribe(
        &self,
        queue: &str,
        options: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, ConsumerError> {
        let (generation, delay) = {
            let mut inner = self.lock()?;
            *inner.subscribe_attempts.entry(queue.to_string()).or_default() += 1;
            inner.check_available()?;
            if inner.failing_subscribes > 0 {
                inner.failing_subscribes -= 1;
                return Err(ConsumerError::Unavailable(format!(
                    "connection refused while subscribing to '{queue}'"
                )));
            }
            inner.queues.entry(queue.to_string()).or_default().consumers += 1;
            (inner.generation, inner.subscribe_delay.take())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        debug!(queue = %queue, consumer_tag = %options.consumer_tag, "In-memory subscription opened");
        Ok(Box::new(MemorySubscription {
            broker: self.clone(),
            queue: queue.to_string(),
            prefetch: usize::from(options.prefetch.max(1)),
            generation,
            in_flight: BTreeMap::new(),
            released: false,
        }))
    }

    async fn health_check(&self) -> Result<(), ConsumerError> {
        self.lock()?.check_available()
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}

#[async_trait]
impl QueueBinder for InMemoryBroker {
    async fn declare_queue(&self, queue: &str) -> Result<(), ConsumerError> {
        let mut inner = self.lock()?;
        inner.check_available()?;
        inner.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ConsumerError> {
        let mut inner = self.lock()?;
        inner.check_available()?;
        if !inner.exchanges.contains_key(exchange) {
            return Err(ConsumerError::Unavailable(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        inner.queues.entry(queue.to_string()).or_default();

        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !inner.bindings.contains(&binding) {
            inner.bindings.push(binding);
        }
        Ok(())
    }

    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
    ) -> Result<(), ConsumerError> {
        let mut inner = self.lock()?;
        inner.check_available()?;
        match inner.exchanges.get(exchange) {
            Some(existing) if *existing != kind => Err(ConsumerError::Unavailable(format!(
                "PRECONDITION_FAILED - exchange '{exchange}' already declared as {existing}"
            ))),
            _ => {
                inner.exchanges.insert(exchange.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), ConsumerError> {
        let routed = {
            let mut inner = self.lock()?;
            inner.check_available()?;
            inner.route(exchange, routing_key, body)?
        };
        if routed == 0 {
            debug!(exchange = %exchange, routing_key = %routing_key, "Unroutable message dropped");
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Subscription handed out by [`InMemoryBroker`].
///
/// Dropping it (or cancelling it) returns unacknowledged deliveries to the
/// front of the queue, flagged as redelivered.
pub struct MemorySubscription {
    broker: InMemoryBroker,
    queue: String,
    prefetch: usize,
    generation: u64,
    in_flight: BTreeMap<u64, Vec<u8>>,
    released: bool,
}

impl MemorySubscription {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let in_flight = std::mem::take(&mut self.in_flight);
        self.broker.with_inner(|inner| {
            if let Some(state) = inner.queues.get_mut(&self.queue) {
                for (_, body) in in_flight.into_iter().rev() {
                    state.ready.push_front((body, true));
                }
                state.consumers = state.consumers.saturating_sub(1);
            }
        });
        self.broker.notify.notify_waiters();
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, ConsumerError>> {
        loop {
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = match self.broker.lock() {
                    Ok(inner) => inner,
                    Err(e) => return Some(Err(e)),
                };
                if inner.generation != self.generation {
                    return None;
                }
                if inner.unavailable {
                    return Some(Err(ConsumerError::Unavailable(
                        "connection to in-memory broker lost".to_string(),
                    )));
                }
                if self.in_flight.len() < self.prefetch {
                    let next = inner
                        .queues
                        .get_mut(&self.queue)
                        .and_then(|state| state.ready.pop_front());
                    if let Some((body, redelivered)) = next {
                        inner.next_tag += 1;
                        let delivery_tag = inner.next_tag;
                        self.in_flight.insert(delivery_tag, body.clone());
                        return Some(Ok(Delivery {
                            delivery_tag,
                            body,
                            redelivered,
                        }));
                    }
                }
            }

            notified.await;
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), ConsumerError> {
        let mut inner = self.broker.lock()?;
        let ack_error = |message: &str| ConsumerError::Ack {
            delivery_tag,
            message: message.to_string(),
        };

        if inner.generation != self.generation {
            return Err(ack_error("channel closed"));
        }
        if inner.failing_acks > 0 {
            inner.failing_acks -= 1;
            return Err(ack_error("channel error injected"));
        }
        let body = self
            .in_flight
            .remove(&delivery_tag)
            .ok_or_else(|| ack_error("PRECONDITION_FAILED - unknown delivery tag"))?;
        inner.queues.entry(self.queue.clone()).or_default().acked.push(body);
        Ok(())
    }

    async fn cancel(mut self: Box<Self>) -> Result<(), ConsumerError> {
        self.release();
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.release();
    }
}
