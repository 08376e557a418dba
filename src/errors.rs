// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Dispatch Layer
//!
//! `AmqpError` covers everything that can go wrong while talking to the broker or
//! while setting the dispatcher up. `HandlerError` is what a message handler (or a
//! middleware hook) returns when it fails, and its variant decides whether the
//! failed delivery is retried.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations and dispatcher setup.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// A handler rule was registered without a routing key
    #[error("routing key is not specified")]
    RoutingKeyMissing,

    /// A handler rule was registered without an exchange name
    #[error("exchange name is not specified")]
    ExchangeNameMissing,

    /// A middleware hook failed after the handler succeeded
    #[error("middleware failure `{0}`")]
    MiddlewareError(String),

    /// A handler rule resolved to an empty queue name
    #[error("queue name is not specified")]
    QueueNameMissing,

    /// Handlers and middleware can't be registered while consumers are running
    #[error("registration is closed while consumers are running")]
    RegistrationClosed,

    /// The dispatcher was started without any registered handler
    #[error("no handler registered")]
    NoHandlerRegistered,

    /// Invalid configuration value
    #[error("invalid configuration `{0}`")]
    InvalidConfiguration(String),
}

/// Reasons an inbound payload can't be turned into an envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload is not valid utf-8")]
    NotUtf8,

    #[error("failure to parse payload: {0}")]
    InvalidJson(String),

    #[error("payload has no message id")]
    MissingMessageId,
}

/// Failure reported by a message handler or a middleware hook.
///
/// `Connection` and `Messaging` are transport-level failures: the delivery is
/// acknowledged and dropped because retrying would not help. `Failure` is a
/// regular handler failure and goes through the retry path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("messaging error: {0}")]
    Messaging(String),

    #[error("handler failure: {0}")]
    Failure(String),
}

impl HandlerError {
    /// Creates a regular (retriable) failure.
    pub fn failure(msg: impl Into<String>) -> Self {
        HandlerError::Failure(msg.into())
    }

    /// Whether the failure comes from the broker side rather than the handler itself.
    pub fn is_transport(&self) -> bool {
        matches!(self, HandlerError::Connection(_) | HandlerError::Messaging(_))
    }
}

impl From<lapin::Error> for HandlerError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
                HandlerError::Connection(err.to_string())
            }
            _ => HandlerError::Messaging(err.to_string()),
        }
    }
}

impl From<AmqpError> for HandlerError {
    fn from(err: AmqpError) -> Self {
        match err {
            AmqpError::ConnectionError | AmqpError::ChannelError => {
                HandlerError::Connection(err.to_string())
            }
            _ => HandlerError::Messaging(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_flagged() {
        assert!(HandlerError::Connection("down".into()).is_transport());
        assert!(HandlerError::Messaging("closed".into()).is_transport());
        assert!(!HandlerError::failure("bad input").is_transport());
    }

    #[test]
    fn amqp_errors_map_to_transport_failures() {
        assert_eq!(
            HandlerError::from(AmqpError::ConnectionError),
            HandlerError::Connection("failure to connect".into())
        );
        assert!(HandlerError::from(AmqpError::PublishingError).is_transport());
    }
}
