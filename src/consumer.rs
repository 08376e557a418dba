// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Processing of a single delivery:
//! 1. Parse the body and extract its message id; unparseable messages are acked and dropped
//! 2. Run the before-middleware
//! 3. Invoke the handler with the normalized body inside the delivery's trace context
//! 4. On success ack and run the after-middleware
//! 5. On failure ack and re-publish with an incremented retry header, or drop once
//!    the retry limit is reached or the failure is a transport one
//!
//! Every path acknowledges the original delivery exactly once. Nothing is ever
//! nacked or requeued: redelivery is always an explicit re-publish.

use crate::{
    errors::{AmqpError, HandlerError, PayloadError},
    message::{Envelope, MessageBody},
    middleware::MiddlewareChain,
    otel,
    publisher::RabbitMQPublisher,
    registry::HandlerRule,
    transport::{Acknowledger, InboundDelivery},
};
use futures_util::FutureExt;
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error, field, info, info_span, warn, Instrument};

/// Final state of a processed delivery. The original delivery is acknowledged in all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Succeeded,
    RetryScheduled { retry: u32 },
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Body could not be parsed or carried no message id.
    InvalidPayload,
    /// The handler failed with the retry header at the rule's limit.
    RetriesExhausted,
    /// The handler hit a broker-side error.
    TransportFailure,
    /// Anything else, including ack or re-publish failures.
    Unexpected,
}

/// Acks the wrapped delivery at most once.
struct AckOnce {
    acker: Arc<dyn Acknowledger>,
    attempted: AtomicBool,
}

impl AckOnce {
    fn new(acker: Arc<dyn Acknowledger>) -> AckOnce {
        AckOnce {
            acker,
            attempted: AtomicBool::new(false),
        }
    }

    async fn ack(&self) -> Result<(), AmqpError> {
        if self.attempted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.acker.ack().await
    }

    fn is_pending(&self) -> bool {
        !self.attempted.load(Ordering::SeqCst)
    }
}

/// Runs deliveries through middleware and handlers.
pub struct DeliveryProcessor {
    middleware: Arc<MiddlewareChain>,
    publisher: Arc<RabbitMQPublisher>,
    tracer: BoxedTracer,
}

impl DeliveryProcessor {
    pub fn new(middleware: Arc<MiddlewareChain>, publisher: Arc<RabbitMQPublisher>) -> Self {
        DeliveryProcessor {
            middleware,
            publisher,
            tracer: global::tracer("amqp consumer"),
        }
    }

    /// Processes one delivery for `rule`. Never fails: whatever happens, the
    /// delivery ends up acknowledged.
    pub async fn process(&self, rule: &HandlerRule, delivery: InboundDelivery) -> DeliveryOutcome {
        let span = info_span!(
            "delivery",
            handler = rule.name(),
            routing_key = %delivery.routing_key,
            exchange = %delivery.exchange,
            message_id = field::Empty,
        );

        self.process_in_span(rule, delivery).instrument(span).await
    }

    async fn process_in_span(&self, rule: &HandlerRule, delivery: InboundDelivery) -> DeliveryOutcome {
        info!("message handler start");
        let ack = AckOnce::new(delivery.acker.clone());

        let outcome = match self.handle(rule, &delivery, &ack).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(error = err.to_string(), "unknown error while handling message");
                DeliveryOutcome::Dropped(DropReason::Unexpected)
            }
        };

        if ack.is_pending() {
            if let Err(err) = ack.ack().await {
                error!(error = err.to_string(), "error whiling ack msg");
            }
        }

        info!(outcome = ?outcome, "message handler end");
        outcome
    }

    async fn handle(
        &self,
        rule: &HandlerRule,
        delivery: &InboundDelivery,
        ack: &AckOnce,
    ) -> Result<DeliveryOutcome, AmqpError> {
        let envelope = match parse(delivery) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    body = %String::from_utf8_lossy(&delivery.data),
                    "removing message from queue - reason: invalid payload"
                );
                ack.ack().await?;
                return Ok(DeliveryOutcome::Dropped(DropReason::InvalidPayload));
            }
        };

        tracing::Span::current().record("message_id", envelope.message_id.as_str());
        debug!(
            retry = envelope.retry_count(),
            body = %envelope.body.normalize(),
            "received data"
        );

        let (ctx, mut span) = otel::new_span(&envelope.headers, &self.tracer, rule.name());

        let result = match run_hooks(|| self.middleware.run_before(&envelope.body, &envelope)) {
            Ok(()) => {
                let body = envelope.body.normalize();
                AssertUnwindSafe(rule.handler().exec(&ctx, &body))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(HandlerError::failure("handler panicked")))
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(true) => {
                debug!("message successfully processed");
                ack.ack().await?;
                span.set_status(Status::Ok);

                if let Err(err) =
                    run_hooks(|| self.middleware.run_after(&envelope.body, &envelope))
                {
                    span.record_error(&err);
                    return Err(AmqpError::MiddlewareError(err.to_string()));
                }

                Ok(DeliveryOutcome::Succeeded)
            }
            Ok(false) => {
                info!("no ack message");
                self.retry(rule, &envelope, ack, &mut span).await
            }
            Err(err) if err.is_transport() => {
                error!(
                    error = err.to_string(),
                    "transport error while handling message, dropping"
                );
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("transport failure"),
                });
                ack.ack().await?;
                Ok(DeliveryOutcome::Dropped(DropReason::TransportFailure))
            }
            Err(err) => {
                warn!(error = err.to_string(), "handler message failed");
                span.record_error(&err);
                self.retry(rule, &envelope, ack, &mut span).await
            }
        }
    }

    async fn retry(
        &self,
        rule: &HandlerRule,
        envelope: &Envelope,
        ack: &AckOnce,
        span: &mut BoxedSpan,
    ) -> Result<DeliveryOutcome, AmqpError> {
        let retry = envelope.retry_count();

        if retry >= rule.retry_limit() {
            ack.ack().await?;
            error!(
                retry_limit = rule.retry_limit(),
                body = %envelope.body.normalize(),
                "too many attempts, handler failed"
            );
            span.set_status(Status::Error {
                description: Cow::from("retries exhausted"),
            });
            return Ok(DeliveryOutcome::Dropped(DropReason::RetriesExhausted));
        }

        ack.ack().await?;
        self.publisher
            .retry_send(envelope, rule.queue_name(), retry + 1)
            .await?;

        span.set_status(Status::Error {
            description: Cow::from("requeued for retry"),
        });
        Ok(DeliveryOutcome::RetryScheduled { retry: retry + 1 })
    }
}

fn parse(delivery: &InboundDelivery) -> Result<Envelope, PayloadError> {
    let body = MessageBody::from_wire(delivery.content_type.as_deref(), &delivery.data)?;
    let message_id = body.message_id()?;

    Ok(Envelope {
        body,
        headers: delivery.headers.clone(),
        message_id,
        routing_key: delivery.routing_key.clone(),
        exchange_name: delivery.exchange.clone(),
        redelivered: delivery.redelivered,
    })
}

fn run_hooks<F>(hooks: F) -> Result<(), HandlerError>
where
    F: FnOnce() -> Result<(), HandlerError>,
{
    std::panic::catch_unwind(AssertUnwindSafe(hooks))
        .unwrap_or_else(|_| Err(HandlerError::failure("middleware panicked")))
}
