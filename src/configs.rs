// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker and Application Configuration
//!
//! Connection settings shared by every consumer and publisher of a service.
//! Values are loaded from an optional `messaging.yaml` file and then from
//! environment variables using `__` as the section separator, for example
//! `RABBITMQ__HOST=broker` or `APP__NAME=orders-service`.

use crate::errors::AmqpError;
use serde::Deserialize;
use tracing::error;

/// Base name of the optional configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "messaging";

/// Application identity, used as the AMQP connection name.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfigs {
    pub name: String,
}

impl Default for AppConfigs {
    fn default() -> Self {
        AppConfigs {
            name: "rabbitmq-messaging".to_owned(),
        }
    }
}

/// RabbitMQ connection parameters.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
        }
    }
}

impl RabbitMQConfigs {
    /// Builds the AMQP URI for these settings.
    ///
    /// The default vhost `/` is percent-encoded as `%2f`.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user,
            self.password,
            self.host,
            self.port,
            self.vhost.replace('/', "%2f")
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Configs {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,
}

impl Configs {
    /// Loads the configuration from `messaging.yaml` (if present) and the
    /// environment. Later sources override earlier ones.
    pub fn load() -> Result<Self, AmqpError> {
        use ::config::{Config, Environment, File};

        let built = Config::builder()
            .add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false))
            .add_source(Environment::default().separator("__").try_parsing(true))
            .build();

        match built.and_then(|cfg| cfg.try_deserialize::<Configs>()) {
            Ok(cfg) => Ok(cfg),
            Err(err) => {
                error!(error = err.to_string(), "failure to load messaging configs");
                Err(AmqpError::ConfigurationError(err.to_string()))
            }
        }
    }
}
