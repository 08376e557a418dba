// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker for tests.
//!
//! Implements the routing the dispatcher depends on: named exchanges with
//! bindings, the default exchange routing by queue name, per-message expiration
//! driven by a manual clock, and dead-lettering of expired messages.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind, DEFAULT_EXCHANGE},
    message::OutboundMessage,
    queue::{QueueBinding, QueueDefinition},
    transport::{Acknowledger, DeliveryStream, InboundDelivery, Transport},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BrokerEvent {
    DeclareExchange(String),
    DeclareQueue(String),
    Bind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Publish {
        exchange: String,
        routing_key: String,
    },
}

struct StoredMessage {
    msg: OutboundMessage,
    expires_at: Option<Duration>,
}

struct StoredQueue {
    def: QueueDefinition,
    messages: VecDeque<StoredMessage>,
}

#[derive(Default)]
struct BrokerState {
    now: Duration,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, StoredQueue>,
    bindings: Vec<QueueBinding>,
    consumers: HashMap<String, UnboundedSender<InboundDelivery>>,
    published: Vec<OutboundMessage>,
    events: Vec<BrokerEvent>,
}

#[derive(Default)]
pub(crate) struct MemoryBroker {
    state: Mutex<BrokerState>,
    acks: Arc<AtomicUsize>,
    fail_publish: AtomicBool,
}

struct MemoryAcker {
    acks: Arc<AtomicUsize>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl MemoryBroker {
    pub(crate) fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    pub(crate) fn acks(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    pub(crate) fn events(&self) -> Vec<BrokerEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub(crate) fn published(&self) -> Vec<OutboundMessage> {
        self.state.lock().unwrap().published.clone()
    }

    pub(crate) fn queue_len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or_default()
    }

    pub(crate) fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Pops the next message of `queue` as a delivery.
    pub(crate) fn take(&self, queue: &str) -> Option<InboundDelivery> {
        let mut state = self.state.lock().unwrap();
        let stored = state.queues.get_mut(queue)?.messages.pop_front()?;
        Some(self.delivery(stored.msg))
    }

    /// Moves the clock forward, dead-lettering every message that expired.
    pub(crate) fn advance(&self, by: Duration) {
        let mut state = self.state.lock().unwrap();
        state.now += by;
        let now = state.now;

        let mut expired = vec![];
        for queue in state.queues.values_mut() {
            let (gone, kept): (Vec<_>, Vec<_>) = queue
                .messages
                .drain(..)
                .partition(|m| m.expires_at.is_some_and(|at| at <= now));
            queue.messages = kept.into();

            if let (Some(exchange), Some(key)) = (
                queue.def.dead_letter_exchange.clone(),
                queue.def.dead_letter_routing_key.clone(),
            ) {
                for stored in gone {
                    expired.push((exchange.clone(), key.clone(), stored.msg));
                }
            }
        }

        for (exchange, routing_key, msg) in expired {
            let msg = OutboundMessage {
                exchange: exchange.clone(),
                routing_key: routing_key.clone(),
                expiration: None,
                ..msg
            };
            self.route(&mut state, msg);
        }
    }

    fn delivery(&self, msg: OutboundMessage) -> InboundDelivery {
        InboundDelivery {
            data: msg.body.to_bytes(),
            content_type: Some(msg.body.content_type().to_owned()),
            headers: msg.headers,
            routing_key: msg.routing_key,
            exchange: msg.exchange,
            redelivered: false,
            acker: Arc::new(MemoryAcker {
                acks: self.acks.clone(),
            }),
        }
    }

    fn route(&self, state: &mut BrokerState, msg: OutboundMessage) {
        let targets: Vec<String> = if msg.exchange == DEFAULT_EXCHANGE {
            vec![msg.routing_key.clone()]
        } else {
            let kind = state
                .exchanges
                .get(&msg.exchange)
                .map(|e| e.exchange_kind())
                .unwrap_or_default();
            state
                .bindings
                .iter()
                .filter(|b| b.exchange_name == msg.exchange)
                .filter(|b| match kind {
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Topic => topic_matches(&b.routing_key, &msg.routing_key),
                    _ => b.routing_key == msg.routing_key,
                })
                .map(|b| b.queue_name.clone())
                .collect()
        };

        let now = state.now;
        for target in targets {
            if !state.queues.contains_key(&target) {
                continue;
            }

            if let Some(consumer) = state.consumers.get(&target) {
                if consumer.send(self.delivery(msg.clone())).is_ok() {
                    continue;
                }
            }

            if let Some(queue) = state.queues.get_mut(&target) {
                queue.messages.push_back(StoredMessage {
                    expires_at: msg.expiration.map(|d| now + d),
                    msg: msg.clone(),
                });
            }
        }
    }
}

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
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        {
            let mut state = self.state.lock().unwrap();
            state
                .events
                .push(BrokerEvent::DeclareExchange(def.name().to_owned()));
            state.exchanges.insert(def.name().to_owned(), def.clone());
        }
        // give concurrent publishers a chance to interleave
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        {
            let mut state = self.state.lock().unwrap();
            state
                .events
                .push(BrokerEvent::DeclareQueue(def.name().to_owned()));
            state
                .queues
                .entry(def.name().to_owned())
                .or_insert_with(|| StoredQueue {
                    def: def.clone(),
                    messages: VecDeque::new(),
                });
        }
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.state.lock().unwrap();
        state.events.push(BrokerEvent::Bind {
            queue: binding.queue_name().to_owned(),
            exchange: binding.exchange_name().to_owned(),
            routing_key: binding.key().to_owned(),
        });
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(AmqpError::PublishingError);
        }

        let mut state = self.state.lock().unwrap();
        if msg.exchange != DEFAULT_EXCHANGE && !state.exchanges.contains_key(&msg.exchange) {
            return Err(AmqpError::PublishingError);
        }

        state.events.push(BrokerEvent::Publish {
            exchange: msg.exchange.clone(),
            routing_key: msg.routing_key.clone(),
        });
        state.published.push(msg.clone());
        self.route(&mut state, msg.clone());
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        _prefetch: u16,
    ) -> Result<DeliveryStream, AmqpError> {
        let (tx, rx) = unbounded_channel();
        let mut state = self.state.lock().unwrap();

        let Some(stored) = state.queues.get_mut(queue) else {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        };
        let pending: Vec<StoredMessage> = stored.messages.drain(..).collect();
        for message in pending {
            let _ = tx.send(self.delivery(message.msg));
        }
        state.consumers.insert(queue.to_owned(), tx);

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBody;

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("orders.created", "orders.created"));
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(!topic_matches("billing.*", "orders.created"));
    }

    #[tokio::test]
    async fn expired_messages_are_dead_lettered() {
        let broker = MemoryBroker::new();
        broker.declare_queue(&QueueDefinition::new("target")).await.unwrap();
        broker
            .declare_queue(&QueueDefinition::new("parking").dead_letter("", "target"))
            .await
            .unwrap();

        broker
            .publish(&OutboundMessage {
                exchange: String::new(),
                routing_key: "parking".to_owned(),
                body: MessageBody::from("x"),
                headers: Default::default(),
                expiration: Some(Duration::from_millis(50)),
            })
            .await
            .unwrap();

        broker.advance(Duration::from_millis(49));
        assert_eq!(broker.queue_len("parking"), 1);
        assert_eq!(broker.queue_len("target"), 0);

        broker.advance(Duration::from_millis(1));
        assert_eq!(broker.queue_len("parking"), 0);
        assert_eq!(broker.queue_len("target"), 1);
    }
}
