//! Broker abstraction used by workers and the publishing side.
//!
//! `Broker`/`Subscription` cover consuming, `QueueBinder` covers topology and
//! publishing. [`crate::LapinBroker`] implements both against RabbitMQ;
//! [`crate::InMemoryBroker`] implements both in process.

use crate::error::ConsumerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to acknowledge this delivery
    pub delivery_tag: u64,
    /// Raw message body
    pub body: Vec<u8>,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
}

/// Options for opening a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Maximum unacknowledged deliveries in flight
    pub prefetch: u16,
    /// Tag identifying this consumer on the broker
    pub consumer_tag: String,
}

/// A live consumer on one queue.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery.
    ///
    /// `None` means the broker ended the stream; `Some(Err)` means the
    /// connection or channel failed.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, ConsumerError>>;

    /// Acknowledge a delivery.
    async fn ack(&mut self, delivery_tag: u64) -> Result<(), ConsumerError>;

    /// Cancel the consumer and close the underlying channel and connection.
    ///
    /// Deliveries not yet acknowledged go back to the queue.
    async fn cancel(self: Box<Self>) -> Result<(), ConsumerError>;
}

/// Something that can open subscriptions.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Connect, declare `queue` as durable, apply prefetch, and start consuming.
    async fn subscribe(
        &self,
        queue: &str,
        options: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, ConsumerError>;

    /// Check that the broker is reachable.
    async fn health_check(&self) -> Result<(), ConsumerError> {
        Ok(())
    }

    /// Human-readable target, for logs.
    fn describe(&self) -> String;
}

/// Exchange types the broker understands.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

/// Topology and publishing operations.
#[async_trait]
pub trait QueueBinder: Send + Sync + 'static {
    /// Declare a durable queue. Idempotent.
    async fn declare_queue(&self, queue: &str) -> Result<(), ConsumerError>;

    /// Declare a durable queue and bind it to `exchange` with `routing_key`.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ConsumerError>;

    /// Declare a durable exchange. Idempotent for matching declarations.
    async fn declare_exchange(&self, exchange: &str, kind: ExchangeKind)
    -> Result<(), ConsumerError>;

    /// Publish a persistent message and wait for the broker to confirm it.
    ///
    /// An empty `exchange` is the default exchange, which routes by queue name.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), ConsumerError>;
}
