// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Every outbound path goes through [`RabbitMQPublisher`]:
//! - `send` declares the target exchange and publishes to it
//! - `retry_send` re-publishes a failed delivery straight to its handler queue
//! - `delay_send` parks a message on a dead-lettering delay queue until it expires
//!
//! The outbound channel is shared, so each operation holds one lock across its
//! declarations and its publish.

use crate::{
    configs::RabbitMQConfigs,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind, DEFAULT_EXCHANGE},
    message::{with_retry, Envelope, MessageBody, OutboundMessage},
    otel::inject_context,
    topology::delay_queue,
    transport::Transport,
};
use lapin::types::FieldTable;
use opentelemetry::Context;
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// A message to publish through `send` or `delay_send`.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishMessage {
    pub body: MessageBody,
    pub routing_key: String,
    /// Falls back to the configured send exchange.
    pub exchange_name: Option<String>,
    /// Falls back to the configured send exchange type.
    pub exchange_kind: Option<ExchangeKind>,
    pub headers: Option<FieldTable>,
}

impl PublishMessage {
    pub fn new(body: impl Into<MessageBody>, routing_key: &str) -> PublishMessage {
        PublishMessage {
            body: body.into(),
            routing_key: routing_key.to_owned(),
            exchange_name: None,
            exchange_kind: None,
            headers: None,
        }
    }

    pub fn exchange(mut self, name: &str) -> Self {
        self.exchange_name = Some(name.to_owned());
        self
    }

    pub fn exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.exchange_kind = Some(kind);
        self
    }

    pub fn headers(mut self, headers: FieldTable) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// Serialized access to the outbound side of the transport.
pub struct RabbitMQPublisher {
    transport: Arc<dyn Transport>,
    send_exchange_name: String,
    send_exchange_kind: ExchangeKind,
    lock: Mutex<()>,
}

impl RabbitMQPublisher {
    pub fn new(transport: Arc<dyn Transport>, cfg: &RabbitMQConfigs) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher {
            transport,
            send_exchange_name: cfg.send_exchange_name.clone(),
            send_exchange_kind: cfg.send_exchange_type,
            lock: Mutex::new(()),
        })
    }

    fn exchange_name<'m>(&'m self, msg: &'m PublishMessage) -> Result<&'m str, AmqpError> {
        let name = msg
            .exchange_name
            .as_deref()
            .unwrap_or(self.send_exchange_name.as_str());

        if name.is_empty() {
            return Err(AmqpError::ExchangeNameMissing);
        }

        Ok(name)
    }

    /// Declares the target exchange (durable, not auto-deleted) and publishes to it.
    pub async fn send(&self, ctx: &Context, msg: &PublishMessage) -> Result<(), AmqpError> {
        let exchange = ExchangeDefinition::new(self.exchange_name(msg)?)
            .kind(msg.exchange_kind.unwrap_or(self.send_exchange_kind))
            .durable();

        let outbound = OutboundMessage {
            exchange: exchange.name().to_owned(),
            routing_key: msg.routing_key.clone(),
            body: msg.body.clone(),
            headers: inject_context(ctx, &msg.headers.clone().unwrap_or_default()),
            expiration: None,
        };

        let _guard = self.lock.lock().await;
        self.transport.declare_exchange(&exchange).await?;
        self.transport.publish(&outbound).await?;

        info!(
            exchange = %outbound.exchange,
            routing_key = %outbound.routing_key,
            "message sent"
        );
        debug!(body = %outbound.body.normalize(), "send data");

        Ok(())
    }

    /// Re-publishes `envelope` to `queue_name` through the default exchange, with
    /// the retry header set to `retry`.
    pub async fn retry_send(
        &self,
        envelope: &Envelope,
        queue_name: &str,
        retry: u32,
    ) -> Result<(), AmqpError> {
        let outbound = OutboundMessage {
            exchange: DEFAULT_EXCHANGE.to_owned(),
            routing_key: queue_name.to_owned(),
            body: envelope.body.clone(),
            headers: with_retry(&envelope.headers, retry),
            expiration: None,
        };

        let _guard = self.lock.lock().await;
        if let Err(err) = self.transport.publish(&outbound).await {
            error!(error = err.to_string(), queue = queue_name, "failure to retry message");
            return Err(err);
        }

        info!(queue = queue_name, retry, "retry send data");
        Ok(())
    }

    /// Publishes `msg` so that it reaches its destination after `delay`.
    ///
    /// The message sits on the delay queue for `(exchange, routing key)` with a
    /// per-message expiration; the broker dead-letters it to the original
    /// exchange and routing key once expired. Delivery happens at or after
    /// `delay`, never before.
    pub async fn delay_send(
        &self,
        ctx: &Context,
        msg: &PublishMessage,
        delay: Duration,
    ) -> Result<(), AmqpError> {
        if msg.routing_key.is_empty() {
            return Err(AmqpError::RoutingKeyMissing);
        }

        let queue = delay_queue(self.exchange_name(msg)?, &msg.routing_key);

        let outbound = OutboundMessage {
            exchange: DEFAULT_EXCHANGE.to_owned(),
            routing_key: queue.name().to_owned(),
            body: msg.body.clone(),
            headers: inject_context(ctx, &msg.headers.clone().unwrap_or_default()),
            expiration: Some(delay),
        };

        let _guard = self.lock.lock().await;
        self.transport.declare_queue(&queue).await?;
        self.transport.publish(&outbound).await?;

        info!(
            queue = queue.name(),
            delay_ms = delay.as_millis() as u64,
            "delayed message sent"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::{retry_count, RETRY_HEADER},
        testing::{BrokerEvent, MemoryBroker},
        topology::{AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY},
        transport::MockTransport,
    };
    use lapin::types::{AMQPValue, LongString};
    use mockall::Sequence;
    use serde_json::json;

    fn configs() -> RabbitMQConfigs {
        RabbitMQConfigs {
            send_exchange_name: "orders".to_owned(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn send_declares_exchange_then_publishes() {
        let mut seq = Sequence::new();
        let mut transport = MockTransport::new();

        transport
            .expect_declare_exchange()
            .withf(|def| def.name() == "orders" && def.is_durable() && !def.is_auto_delete())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        transport
            .expect_publish()
            .withf(|msg| {
                msg.exchange == "orders"
                    && msg.routing_key == "orders.created"
                    && msg.expiration.is_none()
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let publisher = RabbitMQPublisher::new(Arc::new(transport), &configs());
        publisher
            .send(
                &Context::new(),
                &PublishMessage::new(json!({"message_id": 1}), "orders.created"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn send_without_exchange_fails() {
        let mut transport = MockTransport::new();
        transport.expect_publish().times(0);

        let publisher = RabbitMQPublisher::new(Arc::new(transport), &RabbitMQConfigs::default());

        assert_eq!(
            publisher
                .send(&Context::new(), &PublishMessage::new("{}", "key"))
                .await,
            Err(AmqpError::ExchangeNameMissing)
        );
    }

    #[tokio::test]
    async fn retry_send_targets_handler_queue() {
        let mut transport = MockTransport::new();
        transport
            .expect_publish()
            .withf(|msg| {
                msg.exchange.is_empty()
                    && msg.routing_key == "create_order"
                    && retry_count(&msg.headers) == 2
                    && msg.headers.inner().contains_key("tenant")
            })
            .times(1)
            .returning(|_| Ok(()));

        let mut headers = FieldTable::default();
        headers.insert(RETRY_HEADER.into(), AMQPValue::LongInt(1));
        headers.insert("tenant".into(), AMQPValue::LongString("acme".into()));

        let envelope = Envelope {
            body: MessageBody::from(json!({"message_id": 9})),
            headers,
            message_id: "9".to_owned(),
            routing_key: "orders.created".to_owned(),
            exchange_name: "orders".to_owned(),
            redelivered: false,
        };

        let publisher = RabbitMQPublisher::new(Arc::new(transport), &configs());
        publisher.retry_send(&envelope, "create_order", 2).await.unwrap();
    }

    #[tokio::test]
    async fn delay_send_uses_dead_lettering_queue() {
        let mut seq = Sequence::new();
        let mut transport = MockTransport::new();

        transport
            .expect_declare_queue()
            .withf(|def| {
                let args = crate::topology::queue_arguments(def);
                def.name() == "orders_orderscreated_delay"
                    && args.inner().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)
                        == Some(&AMQPValue::LongString(LongString::from("orders")))
                    && args.inner().get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
                        == Some(&AMQPValue::LongString(LongString::from("orders.created")))
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        transport
            .expect_publish()
            .withf(|msg| {
                msg.exchange.is_empty()
                    && msg.routing_key == "orders_orderscreated_delay"
                    && msg.expiration == Some(Duration::from_secs(10))
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let publisher = RabbitMQPublisher::new(Arc::new(transport), &configs());
        publisher
            .delay_send(
                &Context::new(),
                &PublishMessage::new(json!({"message_id": 3}), "orders.created"),
                Duration::from_secs(10),
            )
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_never_interleave() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = RabbitMQPublisher::new(broker.clone(), &configs());

        let mut tasks = vec![];
        for i in 0..16 {
            let publisher = publisher.clone();
            tasks.push(tokio::spawn(async move {
                let msg = PublishMessage::new(json!({"message_id": i}), &format!("key.{}", i))
                    .exchange(&format!("exchange_{}", i));
                publisher.send(&Context::new(), &msg).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let events = broker.events();
        assert_eq!(events.len(), 32);
        for pair in events.chunks(2) {
            match pair {
                [BrokerEvent::DeclareExchange(declared), BrokerEvent::Publish { exchange, .. }] => {
                    assert_eq!(declared, exchange)
                }
                other => panic!("interleaved publish: {:?}", other),
            }
        }
    }
}
