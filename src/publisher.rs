// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes JSON messages either straight to a queue through the default
//! exchange, or to a direct exchange fanned out to several queues by routing
//! key. Every call acquires its own channel, makes sure the destination
//! topology exists, serializes the message once and releases the channel
//! afterwards. Failures are logged and returned; retrying is up to the caller.

use crate::{
    channel::{AmqpChannel, ChannelProvider},
    errors::AmqpError,
    otel,
    subscription::SubscriptionConfig,
    topology::TopologyBuilder,
};
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

pub struct RabbitMQPublisher {
    provider: Arc<dyn ChannelProvider>,
    dead_letter_enabled: bool,
}

impl RabbitMQPublisher {
    /// Creates a publisher.
    ///
    /// `dead_letter_enabled` must match the consumers of the target queues:
    /// queues are declared with the same dead-letter arguments consumers use.
    pub fn new(provider: Arc<dyn ChannelProvider>, dead_letter_enabled: bool) -> Self {
        RabbitMQPublisher {
            provider,
            dead_letter_enabled,
        }
    }

    /// Publishes `message` to `queue_name` through the default exchange.
    pub async fn publish_to_queue<T>(
        &self,
        ctx: &Context,
        message: &T,
        queue_name: &str,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = serialize(message)?;
        self.publish_raw_to_queue(ctx, &payload, queue_name).await
    }

    /// Publishes an already serialized JSON body to `queue_name`.
    pub async fn publish_raw_to_queue(
        &self,
        ctx: &Context,
        payload: &[u8],
        queue_name: &str,
    ) -> Result<(), AmqpError> {
        let target = SubscriptionConfig::queue(queue_name);
        let channel = self.provider.acquire_channel().await?;

        let result = async {
            TopologyBuilder::ensure_publish_topology(
                channel.as_ref(),
                &target,
                self.dead_letter_enabled,
            )
            .await?;

            self.send(channel.as_ref(), ctx, "", queue_name, payload)
                .await
        }
        .await;

        release(channel.as_ref()).await;
        result
    }

    /// Publishes `message` once per `(routing_key, queue_name)` route on
    /// `exchange_name`, binding each queue first.
    ///
    /// Routes are declared and published in the given order.
    pub async fn publish_to_exchange<T>(
        &self,
        ctx: &Context,
        message: &T,
        exchange_name: &str,
        routes: &[(String, String)],
    ) -> Result<(), AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        if routes.is_empty() {
            return Err(AmqpError::ConfigurationError(format!(
                "no routes given for exchange `{exchange_name}`"
            )));
        }

        let payload = serialize(message)?;
        let channel = self.provider.acquire_channel().await?;

        let result = async {
            for (routing_key, queue_name) in routes {
                let target = SubscriptionConfig::exchange(exchange_name, routing_key, queue_name);
                TopologyBuilder::ensure_publish_topology(
                    channel.as_ref(),
                    &target,
                    self.dead_letter_enabled,
                )
                .await?;
            }

            for (routing_key, _) in routes {
                self.send(channel.as_ref(), ctx, exchange_name, routing_key, &payload)
                    .await?;
            }

            Ok::<(), AmqpError>(())
        }
        .await;

        release(channel.as_ref()).await;
        result
    }

    async fn send(
        &self,
        channel: &dyn AmqpChannel,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        let headers = otel::inject_headers(ctx);

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));

        match channel
            .publish(exchange, routing_key, payload, properties)
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, "error publishing message"
                );
                Err(err)
            }
            Ok(()) => {
                debug!(exchange, routing_key, "message published");
                Ok(())
            }
        }
    }
}

fn serialize<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(message).map_err(|err| {
        error!(error = err.to_string(), "error serializing message");
        AmqpError::SerializationError(err.to_string())
    })
}

async fn release(channel: &dyn AmqpChannel) {
    if let Err(err) = channel.close().await {
        debug!(error = err.to_string(), "failure to release publish channel");
    }
}
