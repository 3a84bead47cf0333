// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Framework
//!
//! `AmqpError` covers every failure the framework itself can raise while
//! connecting, declaring topology, consuming and publishing. `HandlerError`
//! is the error business handlers return; it is retried and dead-lettered by
//! the consumer and never escapes the consumer boundary.

use std::fmt::Write;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Invalid or missing consumer/publisher configuration
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error serializing an outgoing message
    #[error("failure to serialize message `{0}`")]
    SerializationError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error publishing a failure envelope to the dead-letter exchange
    #[error("failure to publish to dlq `{0}`")]
    PublishingToDLQError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

/// Error returned by a message handler.
///
/// Every handler error is treated as retryable. `reason` becomes the
/// `failureReason` of the dead-letter envelope and `detail` its
/// `failureDetail`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct HandlerError {
    reason: String,
    detail: Option<String>,
}

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        HandlerError {
            reason: reason.into(),
            detail: None,
        }
    }

    /// Builds a handler error from an underlying error, keeping its full
    /// source chain as the detail.
    pub fn with_source(reason: impl Into<String>, source: &(dyn std::error::Error + 'static)) -> Self {
        HandlerError {
            reason: reason.into(),
            detail: Some(source_chain(source)),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// The detail text, falling back to the reason when none was attached.
    pub fn detail(&self) -> &str {
        self.detail.as_deref().unwrap_or(&self.reason)
    }
}

impl From<&str> for HandlerError {
    fn from(value: &str) -> Self {
        HandlerError::new(value)
    }
}

impl From<String> for HandlerError {
    fn from(value: String) -> Self {
        HandlerError::new(value)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::with_source("failure to deserialize message body", &err)
    }
}

impl From<AmqpError> for HandlerError {
    fn from(err: AmqpError) -> Self {
        HandlerError::with_source(err.to_string(), &err)
    }
}

fn source_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = String::new();
    let mut current = Some(err);

    while let Some(e) = current {
        if !out.is_empty() {
            out.push_str(": ");
        }
        let _ = write!(out, "{e}");
        current = e.source();
    }

    out
}
