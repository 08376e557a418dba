// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! The entry point of the crate. A dispatcher owns the handler registry, the
//! middleware chain and the publisher of one broker connection:
//!
//! ```no_run
//! use rabmq::{
//!     configs::RabbitMQConfigs,
//!     dispatcher::RabbitMQDispatcher,
//!     publisher::PublishMessage,
//!     registry::{handler_fn, HandlerRule},
//! };
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), rabmq::errors::AmqpError> {
//! let configs = RabbitMQConfigs::from_env()?;
//! let mut dispatcher = RabbitMQDispatcher::connect(&configs).await?;
//!
//! dispatcher.register(
//!     HandlerRule::new(
//!         "create_order",
//!         "orders",
//!         "orders.created",
//!         handler_fn(|body| async move { Ok(!body.is_empty()) }),
//!     )
//!     .with_retry_limit(2),
//! )?;
//!
//! let consumers = dispatcher.start_consumers().await?;
//! dispatcher
//!     .send(&PublishMessage::new(json!({"message_id": 1}), "orders.created"))
//!     .await?;
//!
//! consumers.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Handlers and middleware are registered before `start_consumers`; once the
//! consumers run, the registry is shared with them and further registration fails.

use crate::{
    configs::RabbitMQConfigs,
    consumer::DeliveryProcessor,
    errors::{AmqpError, HandlerError},
    message::{Envelope, MessageBody},
    middleware::MiddlewareChain,
    publisher::{PublishMessage, RabbitMQPublisher},
    registry::{HandlerRegistry, HandlerRule},
    runner::{ConsumerHandle, ConsumerRunner},
    transport::{AmqpTransport, Transport},
};
use opentelemetry::Context;
use std::{sync::Arc, time::Duration};
use tracing::info;

pub struct RabbitMQDispatcher {
    transport: Arc<dyn Transport>,
    registry: Arc<HandlerRegistry>,
    middleware: Arc<MiddlewareChain>,
    publisher: Arc<RabbitMQPublisher>,
}

impl RabbitMQDispatcher {
    /// Connects to the broker described by `cfg`.
    pub async fn connect(cfg: &RabbitMQConfigs) -> Result<RabbitMQDispatcher, AmqpError> {
        let transport = AmqpTransport::connect(cfg).await?;
        Ok(RabbitMQDispatcher::new(transport, cfg))
    }

    /// Creates a dispatcher over an already connected transport.
    pub fn new(transport: Arc<dyn Transport>, cfg: &RabbitMQConfigs) -> RabbitMQDispatcher {
        RabbitMQDispatcher {
            publisher: RabbitMQPublisher::new(transport.clone(), cfg),
            transport,
            registry: Arc::new(HandlerRegistry::new()),
            middleware: Arc::new(MiddlewareChain::new()),
        }
    }

    /// Registers a handler rule.
    ///
    /// Fails with `RoutingKeyMissing`, `ExchangeNameMissing` or `QueueNameMissing` on an incomplete rule
    /// and with `RegistrationClosed` once consumers were started.
    pub fn register(&mut self, rule: HandlerRule) -> Result<&HandlerRule, AmqpError> {
        let registry = Arc::get_mut(&mut self.registry).ok_or(AmqpError::RegistrationClosed)?;
        let rule = registry.register(rule)?;

        info!(
            handler = rule.name(),
            exchange = rule.exchange_name(),
            routing_key = rule.routing_key(),
            queue = rule.queue_name(),
            retry_limit = rule.retry_limit(),
            "handler registered"
        );

        Ok(rule)
    }

    /// Adds a hook that runs before every handler invocation.
    pub fn on_before_handle<F>(&mut self, hook: F) -> Result<(), AmqpError>
    where
        F: Fn(&MessageBody, &Envelope) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.middleware_mut()?.register_before(hook);
        Ok(())
    }

    /// Adds a hook that runs after every successful handler invocation.
    pub fn on_after_handle<F>(&mut self, hook: F) -> Result<(), AmqpError>
    where
        F: Fn(&MessageBody, &Envelope) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.middleware_mut()?.register_after(hook);
        Ok(())
    }

    fn middleware_mut(&mut self) -> Result<&mut MiddlewareChain, AmqpError> {
        Arc::get_mut(&mut self.middleware).ok_or(AmqpError::RegistrationClosed)
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn publisher(&self) -> Arc<RabbitMQPublisher> {
        self.publisher.clone()
    }

    /// Publishes `msg` in the current trace context.
    pub async fn send(&self, msg: &PublishMessage) -> Result<(), AmqpError> {
        self.publisher.send(&Context::current(), msg).await
    }

    /// Publishes `msg` so that it is routed after `delay`.
    pub async fn delay_send(&self, msg: &PublishMessage, delay: Duration) -> Result<(), AmqpError> {
        self.publisher
            .delay_send(&Context::current(), msg, delay)
            .await
    }

    /// Declares every rule's topology and starts consuming.
    ///
    /// Registration stays closed for as long as the returned handle's consumers
    /// hold the registry.
    pub async fn start_consumers(&self) -> Result<ConsumerHandle, AmqpError> {
        let processor = DeliveryProcessor::new(self.middleware.clone(), self.publisher.clone());

        ConsumerRunner::new(
            self.transport.clone(),
            self.registry.clone(),
            Arc::new(processor),
        )
        .start()
        .await
    }
}
