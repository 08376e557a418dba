// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dispatcher Configuration
//!
//! Broker connection details plus the exchange used by `send` when the caller
//! doesn't name one. Values can be deserialized with serde or read from the
//! `RABMQ_*` environment variables.

use crate::{errors::AmqpError, exchange::ExchangeKind};
use serde::Deserialize;

pub const ENV_RABBITMQ_URL: &str = "RABMQ_RABBITMQ_URL";
pub const ENV_SEND_EXCHANGE_NAME: &str = "RABMQ_SEND_EXCHANGE_NAME";
pub const ENV_SEND_EXCHANGE_TYPE: &str = "RABMQ_SEND_EXCHANGE_TYPE";
pub const ENV_APP_NAME: &str = "RABMQ_APP_NAME";

/// Connection and publishing settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    /// Name reported to the broker as the connection name.
    pub app_name: String,
    /// Full broker URL. Takes precedence over the individual fields below.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Exchange used by `send` when the message doesn't name one.
    pub send_exchange_name: String,
    pub send_exchange_type: ExchangeKind,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            app_name: "rabmq".to_owned(),
            url: None,
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "%2f".to_owned(),
            send_exchange_name: String::new(),
            send_exchange_type: ExchangeKind::Topic,
        }
    }
}

impl RabbitMQConfigs {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<RabbitMQConfigs, AmqpError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup, starting from the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<RabbitMQConfigs, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = RabbitMQConfigs::default();

        if let Some(url) = lookup(ENV_RABBITMQ_URL).filter(|v| !v.is_empty()) {
            if !url.starts_with("amqp://") && !url.starts_with("amqps://") {
                return Err(AmqpError::InvalidConfiguration(format!(
                    "{} must be an amqp url",
                    ENV_RABBITMQ_URL
                )));
            }
            cfg.url = Some(url);
        }

        if let Some(name) = lookup(ENV_SEND_EXCHANGE_NAME) {
            cfg.send_exchange_name = name;
        }

        if let Some(kind) = lookup(ENV_SEND_EXCHANGE_TYPE).filter(|v| !v.is_empty()) {
            cfg.send_exchange_type = kind.parse()?;
        }

        if let Some(app) = lookup(ENV_APP_NAME).filter(|v| !v.is_empty()) {
            cfg.app_name = app;
        }

        Ok(cfg)
    }

    /// The URI used to connect to the broker.
    pub fn uri(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!(
                "amqp://{}:{}@{}:{}/{}",
                self.user, self.password, self.host, self.port, self.vhost
            ),
        }
    }
}
