// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dead-Letter Routing
//!
//! When a message exhausts its retries, [`DeadLetterRouter`] wraps it into a
//! [`FailureEnvelope`] and publishes it to the subscription's dead-letter
//! exchange, after which the original delivery can be acknowledged. Without
//! dead-lettering, or if the envelope cannot be published, the original
//! delivery is rejected without requeue so it is never redelivered in a loop.

use crate::{
    channel::AmqpChannel,
    errors::{AmqpError, HandlerError},
    publisher::JSON_CONTENT_TYPE,
    subscription::DeadLetterConfig,
};
use chrono::{DateTime, Utc};
use lapin::{types::ShortString, BasicProperties};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What to do with the original delivery once its handling is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    RejectWithoutRequeue,
    /// Put the message back on its queue for a later delivery.
    Requeue,
}

/// A failed message and why it failed, as published to the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureEnvelope {
    /// The original JSON document, or its lossy UTF-8 text if it was not JSON.
    pub original_body: Value,
    pub original_routing_key: String,
    pub failure_reason: String,
    pub failure_detail: String,
    #[serde(rename = "failedAtTimestamp")]
    pub failed_at: DateTime<Utc>,
    pub retry_attempts_made: u32,
    pub consumer_identifier: String,
}

impl FailureEnvelope {
    pub fn new(
        body: &[u8],
        routing_key: &str,
        error: &HandlerError,
        retry_attempts_made: u32,
        consumer_identifier: &str,
    ) -> Self {
        let original_body = serde_json::from_slice(body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()));

        FailureEnvelope {
            original_body,
            original_routing_key: routing_key.to_owned(),
            failure_reason: error.reason().to_owned(),
            failure_detail: error.detail().to_owned(),
            failed_at: Utc::now(),
            retry_attempts_made,
            consumer_identifier: consumer_identifier.to_owned(),
        }
    }
}

pub struct DeadLetterRouter {
    config: DeadLetterConfig,
    consumer_name: String,
}

impl DeadLetterRouter {
    pub fn new(config: DeadLetterConfig, consumer_name: impl Into<String>) -> Self {
        DeadLetterRouter {
            config,
            consumer_name: consumer_name.into(),
        }
    }

    pub fn config(&self) -> &DeadLetterConfig {
        &self.config
    }

    /// Settles a message whose retries are exhausted.
    ///
    /// `retry_attempts_made` counts retries, not the first attempt.
    pub async fn handle_exhausted(
        &self,
        channel: &dyn AmqpChannel,
        body: &[u8],
        routing_key: &str,
        error: &HandlerError,
        retry_attempts_made: u32,
    ) -> AckDecision {
        if !self.config.enabled {
            warn!(
                routing_key,
                error = error.to_string(),
                "dead-lettering disabled, rejecting message"
            );
            return AckDecision::RejectWithoutRequeue;
        }

        let envelope = FailureEnvelope::new(
            body,
            routing_key,
            error,
            retry_attempts_made,
            &self.consumer_name,
        );

        match self.publish(channel, &envelope).await {
            Ok(()) => {
                info!(
                    exchange = self.config.exchange,
                    routing_key = self.config.routing_key,
                    "message moved to dlq"
                );
                AckDecision::Ack
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    handler_error = error.to_string(),
                    "error while sending to dlq, rejecting message"
                );
                AckDecision::RejectWithoutRequeue
            }
        }
    }

    async fn publish(
        &self,
        channel: &dyn AmqpChannel,
        envelope: &FailureEnvelope,
    ) -> Result<(), AmqpError> {
        let payload = serde_json::to_vec(envelope)
            .map_err(|err| AmqpError::PublishingToDLQError(err.to_string()))?;

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()));

        channel
            .publish(
                &self.config.exchange,
                &self.config.routing_key,
                &payload,
                properties,
            )
            .await
            .map_err(|err| AmqpError::PublishingToDLQError(err.to_string()))
    }
}
