// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module describes the broker objects the dispatcher relies on and installs
//! them through a [`Transport`]:
//! - one durable exchange, durable queue and binding per registered handler
//! - one delay queue per (exchange, routing key) used by `delay_send`
//!
//! Delay queues never have consumers. Messages published to them carry an
//! expiration; once it elapses the broker dead-letters them back to the original
//! exchange and routing key.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    registry::HandlerRule,
    transport::Transport,
};
use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::collections::BTreeMap;
use tracing::debug;

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// A set of exchanges, queues and bindings to declare together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// The exchange, queue and binding a handler consumes from.
    pub fn for_rule(rule: &HandlerRule) -> Topology {
        let queue = rule.queue_name();

        Topology::new()
            .exchange(
                ExchangeDefinition::new(rule.exchange_name())
                    .kind(rule.exchange_kind())
                    .durable(),
            )
            .queue(QueueDefinition::new(queue).durable())
            .queue_binding(
                QueueBinding::new(queue)
                    .exchange(rule.exchange_name())
                    .routing_key(rule.routing_key()),
            )
    }

    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        if !self.exchanges.iter().any(|e| e.name == def.name) {
            self.exchanges.push(def);
        }
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        if !self.queues.iter().any(|q| q.name == def.name) {
            self.queues.push(def);
        }
        self
    }

    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Declares exchanges, then queues, then bindings.
    pub async fn install(&self, transport: &dyn Transport) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);
            transport.declare_exchange(exch).await?;
        }

        for queue in &self.queues {
            debug!("creating queue: {}", queue.name);
            transport.declare_queue(queue).await?;
        }

        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            transport.bind_queue(binding).await?;
        }

        Ok(())
    }
}

/// Name of the delay queue for an exchange and routing key.
///
/// Non-alphanumeric characters of the routing key are stripped, so repeated
/// calls for the same destination reuse one queue.
pub fn delay_queue_name(exchange_name: &str, routing_key: &str) -> String {
    let key: String = routing_key
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();

    format!("{}_{}_delay", exchange_name, key)
}

/// Delay queue definition dead-lettering back to `exchange_name`/`routing_key`.
pub fn delay_queue(exchange_name: &str, routing_key: &str) -> QueueDefinition {
    QueueDefinition::new(&delay_queue_name(exchange_name, routing_key))
        .durable()
        .dead_letter(exchange_name, routing_key)
}

/// Declaration arguments for a queue definition.
pub(crate) fn queue_arguments(def: &QueueDefinition) -> FieldTable {
    let mut queue_args = BTreeMap::new();

    if let Some(exchange) = &def.dead_letter_exchange {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(exchange.clone())),
        );
    }

    if let Some(key) = &def.dead_letter_routing_key {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(key.clone())),
        );
    }

    if let Some(ttl) = def.ttl {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );
    }

    if let Some(max) = def.max_length {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }

    if let Some(max_bytes) = def.max_length_bytes {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
            AMQPValue::LongInt(LongInt::from(max_bytes)),
        );
    }

    FieldTable::from(queue_args)
}
