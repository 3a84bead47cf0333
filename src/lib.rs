// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Messaging
//!
//! Consumers and publishers for RabbitMQ built on lapin. A consumer declares
//! its subscription topology (including a dead-letter exchange and queue),
//! retries failing handlers with exponential backoff, parks exhausted
//! messages on the dead-letter queue and reports its health. The publisher
//! sends JSON messages to a queue or fans them out through a direct exchange.

mod otel;
#[cfg(test)]
mod testing;

pub mod channel;
pub mod configs;
pub mod connection;
pub mod consumer;
pub mod dead_letter;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod health;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod subscription;
pub mod topology;

pub use configs::Configs;
pub use connection::{AmqpConnection, ConnectionManager, Connector, LapinConnector};
pub use consumer::{ConsumerState, RabbitMQConsumer, ShutdownHandle};
pub use errors::{AmqpError, HandlerError};
pub use handler::{handler_fn, ConsumerHandler, ConsumerMessage};
pub use health::{HealthSnapshot, HealthStatus, HealthTracker};
pub use publisher::RabbitMQPublisher;
pub use subscription::{ConsumerOptions, SubscriptionConfig};
