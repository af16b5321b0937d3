//! RabbitMQ implementation of the broker traits, built on `lapin`.
//!
//! Every subscription owns its own connection and channel so one queue's
//! failure never tears down another. Topology and publish calls open a
//! short-lived connection per request.

use crate::broker::{
    Broker, Delivery, ExchangeKind, QueueBinder, SubscribeOptions, Subscription,
};
use crate::error::ConsumerError;
use async_trait::async_trait;
use core_config::AmqpConfig;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tracing::{debug, info};

const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Broker backed by a RabbitMQ server.
#[derive(Debug, Clone)]
pub struct LapinBroker {
    config: AmqpConfig,
}

impl LapinBroker {
    pub fn new(config: AmqpConfig) -> Self {
        Self { config }
    }

    async fn open(&self) -> Result<(Connection, Channel), ConsumerError> {
        let connection =
            Connection::connect(&self.config.uri(), ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        debug!(endpoint = %self.config.endpoint(), "AMQP channel opened");
        Ok((connection, channel))
    }

    async fn declare_durable_queue(channel: &Channel, queue: &str) -> Result<(), ConsumerError> {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }
}

/// Close a channel and its connection, logging rather than failing.
async fn close_quietly(connection: &Connection, channel: &Channel) {
    if let Err(e) = channel.close(REPLY_SUCCESS, "OK").await {
        debug!(error = %e, "Channel close failed");
    }
    if let Err(e) = connection.close(REPLY_SUCCESS, "OK").await {
        debug!(error = %e, "Connection close failed");
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn subscribe(
        &self,
        queue: &str,
        options: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, ConsumerError> {
        let (connection, channel) = self.open().await?;

        let setup = async {
            Self::declare_durable_queue(&channel, queue).await?;
            channel
                .basic_qos(options.prefetch, BasicQosOptions::default())
                .await?;
            let consumer = channel
                .basic_consume(
                    queue,
                    &options.consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            Ok::<Consumer, ConsumerError>(consumer)
        };

        match setup.await {
            Ok(consumer) => {
                info!(
                    queue = %queue,
                    consumer_tag = %options.consumer_tag,
                    prefetch = options.prefetch,
                    "Subscribed to queue"
                );
                Ok(Box::new(LapinSubscription {
                    connection,
                    channel,
                    consumer,
                    consumer_tag: options.consumer_tag.clone(),
                }))
            }
            Err(e) => {
                close_quietly(&connection, &channel).await;
                Err(e)
            }
        }
    }

    async fn health_check(&self) -> Result<(), ConsumerError> {
        let (connection, channel) = self.open().await?;
        close_quietly(&connection, &channel).await;
        Ok(())
    }

    fn describe(&self) -> String {
        self.config.endpoint()
    }
}

#[async_trait]
impl QueueBinder for LapinBroker {
    async fn declare_queue(&self, queue: &str) -> Result<(), ConsumerError> {
        let (connection, channel) = self.open().await?;
        let result = Self::declare_durable_queue(&channel, queue).await;
        close_quietly(&connection, &channel).await;
        result
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ConsumerError> {
        let (connection, channel) = self.open().await?;
        let result = async {
            Self::declare_durable_queue(&channel, queue).await?;
            channel
                .queue_bind(
                    queue,
                    exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            Ok::<(), ConsumerError>(())
        }
        .await;
        close_quietly(&connection, &channel).await;
        result
    }

    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
    ) -> Result<(), ConsumerError> {
        let lapin_kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        };

        let (connection, channel) = self.open().await?;
        let result = channel
            .exchange_declare(
                exchange,
                lapin_kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(ConsumerError::from);
        close_quietly(&connection, &channel).await;
        result
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), ConsumerError> {
        let (connection, channel) = self.open().await?;
        let result = async {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
            let properties = BasicProperties::default()
                .with_delivery_mode(PERSISTENT)
                .with_content_type("application/json".into());
            let confirmation = channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    body,
                    properties,
                )
                .await?
                .await?;

            if confirmation.is_nack() {
                return Err(ConsumerError::PublishNotConfirmed {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                });
            }
            Ok::<(), ConsumerError>(())
        }
        .await;
        close_quietly(&connection, &channel).await;
        result
    }
}

/// A lapin consumer plus the connection and channel it lives on.
pub struct LapinSubscription {
    connection: Connection,
    channel: Channel,
    consumer: Consumer,
    consumer_tag: String,
}

#[async_trait]
impl Subscription for LapinSubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, ConsumerError>> {
        let next = self.consumer.next().await?;
        Some(
            next.map(|delivery| Delivery {
                delivery_tag: delivery.delivery_tag,
                body: delivery.data,
                redelivered: delivery.redelivered,
            })
            .map_err(ConsumerError::from),
        )
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), ConsumerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| ConsumerError::Ack {
                delivery_tag,
                message: e.to_string(),
            })
    }

    async fn cancel(self: Box<Self>) -> Result<(), ConsumerError> {
        let result = self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(ConsumerError::from);
        if let Err(e) = &result {
            debug!(consumer_tag = %self.consumer_tag, error = %e, "Consumer cancel failed");
        }
        close_quietly(&self.connection, &self.channel).await;
        result
    }
}
