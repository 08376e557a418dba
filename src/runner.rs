// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Runner
//!
//! Declares the topology of every registered rule, opens one consumer per rule
//! and processes the merged deliveries one at a time in a background task.

use crate::{
    consumer::DeliveryProcessor, errors::AmqpError, registry::HandlerRegistry,
    topology::Topology, transport::Transport,
};
use futures_util::{stream::select_all, StreamExt};
use std::sync::Arc;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Unacknowledged deliveries allowed per consumer
pub const CONSUMER_PREFETCH: u16 = 1;

pub struct ConsumerRunner {
    transport: Arc<dyn Transport>,
    registry: Arc<HandlerRegistry>,
    processor: Arc<DeliveryProcessor>,
}

impl ConsumerRunner {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<HandlerRegistry>,
        processor: Arc<DeliveryProcessor>,
    ) -> ConsumerRunner {
        ConsumerRunner {
            transport,
            registry,
            processor,
        }
    }

    /// Subscribes to every registered rule and spawns the receive loop.
    ///
    /// Fails without spawning anything if the registry is empty or if a
    /// declaration or subscription is refused by the broker.
    pub async fn start(&self) -> Result<ConsumerHandle, AmqpError> {
        if self.registry.is_empty() {
            return Err(AmqpError::NoHandlerRegistered);
        }

        let mut streams = Vec::with_capacity(self.registry.len());
        for (index, rule) in self.registry.rules().iter().enumerate() {
            Topology::for_rule(rule)
                .install(self.transport.as_ref())
                .await?;

            let consumer_tag = format!("{}-{}", rule.name(), Uuid::new_v4());
            let stream = self
                .transport
                .consume(rule.queue_name(), &consumer_tag, CONSUMER_PREFETCH)
                .await?;

            info!(
                handler = rule.name(),
                queue = rule.queue_name(),
                routing_key = rule.routing_key(),
                "consumer started"
            );
            streams.push(stream.map(move |result| (index, result)).boxed());
        }

        let (shutdown, signal) = watch::channel(false);
        let registry = self.registry.clone();
        let processor = self.processor.clone();

        let task = tokio::spawn(async move {
            let mut deliveries = select_all(streams);
            let mut signal = signal;

            loop {
                tokio::select! {
                    biased;

                    _ = stopped(&mut signal) => {
                        info!("consumers stopping");
                        break;
                    }

                    next = deliveries.next() => match next {
                        Some((index, Ok(delivery))) => {
                            processor.process(&registry.rules()[index], delivery).await;
                        }
                        Some((index, Err(err))) => error!(
                            error = err.to_string(),
                            handler = registry.rules()[index].name(),
                            "errors consume msg"
                        ),
                        None => {
                            warn!("all consumer streams closed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(ConsumerHandle { shutdown, task })
    }
}

/// Resolves once shutdown was requested. A dropped handle never stops the loop.
async fn stopped(signal: &mut watch::Receiver<bool>) {
    let requested = signal.wait_for(|stop| *stop).await.is_ok();
    if !requested {
        std::future::pending::<()>().await;
    }
}

/// Handle on the background receive loop.
///
/// Dropping the handle detaches the loop; call [`ConsumerHandle::shutdown`] to
/// stop it. A delivery being processed when shutdown is requested is finished first.
pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Signals the loop to stop and waits for it.
    pub async fn shutdown(self) -> Result<(), AmqpError> {
        let _ = self.shutdown.send(true);
        self.wait().await
    }

    /// Waits for the loop to end on its own.
    pub async fn wait(self) -> Result<(), AmqpError> {
        self.task.await.map_err(|err| {
            error!(error = err.to_string(), "consumer task failed");
            AmqpError::InternalError
        })
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
