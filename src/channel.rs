// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels. The
//! outbound channel is opened in publisher-confirm mode; consumer channels get
//! their own QoS so that each consumer holds a bounded number of unacked messages.

use crate::{configs::RabbitMQConfigs, errors::AmqpError};
use lapin::{
    options::{BasicQosOptions, ConfirmSelectOptions},
    types::LongString,
    Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Connects to RabbitMQ and opens the outbound (publishing) channel.
///
/// The channel is put in confirm mode so publishes can wait for the broker's ack.
pub async fn new_amqp_channel(
    cfg: &RabbitMQConfigs,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError {})
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    let channel = match conn.create_channel().await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError {})
        }
    }?;

    if let Err(err) = channel
        .confirm_select(ConfirmSelectOptions { nowait: false })
        .await
    {
        error!(error = err.to_string(), "error to enable publisher confirms");
        return Err(AmqpError::ChannelError {});
    }
    debug!("channel created");

    Ok((Arc::new(conn), Arc::new(channel)))
}

/// Opens a dedicated consumer channel with the given prefetch count.
pub async fn new_consumer_channel(conn: &Connection, prefetch: u16) -> Result<Channel, AmqpError> {
    let channel = match conn.create_channel().await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "error to create the consumer channel");
            Err(AmqpError::ChannelError {})
        }
    }?;

    match channel
        .basic_qos(prefetch, BasicQosOptions { global: false })
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to configure qos");
            Err(AmqpError::QoSDeclarationError(err.to_string()))
        }
        _ => Ok(channel),
    }
}
