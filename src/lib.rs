// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # rabmq
//!
//! Reliable message dispatch over RabbitMQ: handlers are bound to an exchange and
//! routing key, every delivery is acknowledged exactly once, failed deliveries are
//! re-published with a retry counter up to a per-handler limit, and delayed
//! messages are parked on dead-lettering queues until their expiration elapses.
//!
//! Start with [`dispatcher::RabbitMQDispatcher`].

mod otel;
#[cfg(test)]
mod testing;

pub mod channel;
pub mod configs;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod middleware;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod topology;
pub mod transport;
