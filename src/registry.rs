// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Registry
//!
//! A [`HandlerRule`] binds a handler to an (exchange, routing key) pair and names
//! the queue it consumes from. The registry keeps rules in registration order;
//! the consumer runner subscribes to them in that order.

use crate::{
    errors::{AmqpError, HandlerError},
    exchange::ExchangeKind,
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{fmt, future::Future, sync::Arc};

/// Number of re-publishes allowed when a rule doesn't set one
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Processes one message body.
///
/// `Ok(true)` acknowledges the message, `Ok(false)` asks for a retry, and an
/// error is retried too unless it is a transport-level error.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, body: &str) -> Result<bool, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, HandlerError>> + Send,
{
    async fn exec(&self, _ctx: &Context, body: &str) -> Result<bool, HandlerError> {
        (self.0)(body.to_owned()).await
    }
}

/// Wraps an async closure into a [`ConsumerHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Binding of a handler to an exchange and routing key.
#[derive(Clone)]
pub struct HandlerRule {
    pub(crate) name: String,
    pub(crate) exchange_name: String,
    pub(crate) exchange_kind: ExchangeKind,
    pub(crate) routing_key: String,
    pub(crate) queue_name: Option<String>,
    pub(crate) retry_limit: u32,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
}

impl HandlerRule {
    /// Creates a rule for the handler identified by `name`.
    ///
    /// The queue name defaults to `name`, the exchange kind to topic and the retry
    /// limit to [`DEFAULT_RETRY_LIMIT`].
    pub fn new(
        name: &str,
        exchange_name: &str,
        routing_key: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> HandlerRule {
        HandlerRule {
            name: name.to_owned(),
            exchange_name: exchange_name.to_owned(),
            exchange_kind: ExchangeKind::default(),
            routing_key: routing_key.to_owned(),
            queue_name: None,
            retry_limit: DEFAULT_RETRY_LIMIT,
            handler,
        }
    }

    pub fn queue_name(&self) -> &str {
        match &self.queue_name {
            Some(queue) if !queue.is_empty() => queue,
            _ => &self.name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.exchange_kind
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    pub fn handler(&self) -> &Arc<dyn ConsumerHandler> {
        &self.handler
    }

    pub fn with_queue_name(mut self, queue: &str) -> Self {
        self.queue_name = Some(queue.to_owned());
        self
    }

    pub fn with_exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.exchange_kind = kind;
        self
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }
}

impl fmt::Debug for HandlerRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRule")
            .field("name", &self.name)
            .field("exchange_name", &self.exchange_name)
            .field("exchange_kind", &self.exchange_kind)
            .field("routing_key", &self.routing_key)
            .field("queue_name", &self.queue_name())
            .field("retry_limit", &self.retry_limit)
            .finish()
    }
}

/// Ordered set of handler rules.
///
/// Queue names are not checked for uniqueness: two rules sharing a queue compete
/// for its messages.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    rules: Vec<HandlerRule>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    /// Validates and appends a rule, returning the stored rule.
    ///
    /// The routing key, the exchange name and the resolved queue name must all
    /// be non-empty.
    pub fn register(&mut self, mut rule: HandlerRule) -> Result<&HandlerRule, AmqpError> {
        if rule.routing_key.is_empty() {
            return Err(AmqpError::RoutingKeyMissing);
        }

        if rule.exchange_name.is_empty() {
            return Err(AmqpError::ExchangeNameMissing);
        }

        if rule.queue_name().is_empty() {
            return Err(AmqpError::QueueNameMissing);
        }

        rule.queue_name = Some(rule.queue_name().to_owned());
        self.rules.push(rule);

        Ok(&self.rules[self.rules.len() - 1])
    }

    /// Registered rules, in registration order.
    pub fn rules(&self) -> &[HandlerRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
