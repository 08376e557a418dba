// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! The dispatcher only needs a handful of broker primitives: declare exchanges and
//! queues, bind them, publish, and consume with a prefetch limit. [`Transport`]
//! captures exactly that, and [`AmqpTransport`] implements it over `lapin`.

use crate::{
    channel::{new_amqp_channel, new_consumer_channel},
    configs::RabbitMQConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::OutboundMessage,
    queue::{QueueBinding, QueueDefinition},
    topology::queue_arguments,
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, ShortString},
    BasicProperties, Channel, Connection,
};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

/// AMQP delivery mode for messages that survive a broker restart
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Acknowledges one delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;
}

/// A message received from the broker, before any parsing.
pub struct InboundDelivery {
    pub data: Vec<u8>,
    pub content_type: Option<String>,
    pub headers: FieldTable,
    pub routing_key: String,
    pub exchange: String,
    pub redelivered: bool,
    pub acker: Arc<dyn Acknowledger>,
}

impl std::fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("routing_key", &self.routing_key)
            .field("exchange", &self.exchange)
            .field("content_type", &self.content_type)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Stream of deliveries from one consumer.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// Broker capabilities used by the dispatcher.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Publishes a message and waits for the broker to confirm it.
    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError>;

    /// Starts consuming `queue` with at most `prefetch` unacked deliveries.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, AmqpError>;
}

/// [`Transport`] over a lapin connection.
///
/// All publishing goes through one channel; every consumer gets its own channel.
pub struct AmqpTransport {
    conn: Arc<Connection>,
    channel: Arc<Channel>,
}

impl AmqpTransport {
    /// Connects to the broker described by `cfg`.
    pub async fn connect(cfg: &RabbitMQConfigs) -> Result<Arc<AmqpTransport>, AmqpError> {
        let (conn, channel) = new_amqp_channel(cfg).await?;
        Ok(Arc::new(AmqpTransport { conn, channel }))
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                FieldTable::from(def.params.clone()),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                queue_arguments(def),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError> {
        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(msg.body.content_type()))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_headers(msg.headers.clone());

        if let Some(expiration) = msg.expiration {
            props = props.with_expiration(ShortString::from(expiration.as_millis().to_string()));
        }

        let confirm = match self
            .channel
            .basic_publish(
                &msg.exchange,
                &msg.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.body.to_bytes(),
                props,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            Ok(confirm) => Ok(confirm),
        }?;

        match confirm.await {
            Ok(Confirmation::Nack(_)) => {
                error!(exchange = %msg.exchange, "broker refused the message");
                Err(AmqpError::PublishingError)
            }
            Err(err) => {
                error!(error = err.to_string(), "error waiting for publisher confirm");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, AmqpError> {
        let channel = new_consumer_channel(&self.conn, prefetch).await?;

        let consumer = match channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let stream = consumer.map(move |result| {
            // the consumer channel lives as long as its stream
            let _ = &channel;
            match result {
                Ok(delivery) => Ok(inbound(delivery)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            }
        });

        Ok(stream.boxed())
    }
}

fn inbound(delivery: Delivery) -> InboundDelivery {
    InboundDelivery {
        content_type: delivery
            .properties
            .content_type()
            .as_ref()
            .map(|ct| ct.to_string()),
        headers: delivery.properties.headers().clone().unwrap_or_default(),
        routing_key: delivery.routing_key.to_string(),
        exchange: delivery.exchange.to_string(),
        redelivered: delivery.redelivered,
        acker: Arc::new(LapinAcker(delivery.acker)),
        data: delivery.data,
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        match self.0.ack(BasicAckOptions { multiple: false }).await {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError {})
            }
            _ => Ok(()),
        }
    }
}
