// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Abstraction
//!
//! The consumer, publisher and topology code never talk to lapin directly.
//! They go through [`AmqpChannel`], a narrow view of the AMQP 0-9-1 channel
//! operations the framework needs, and obtain channels from a
//! [`ChannelProvider`]. [`LapinChannel`] is the production implementation.

use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ExchangeKind,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

#[cfg(test)]
use mockall::automock;

/// AMQP reply code for a normal close.
pub(crate) const REPLY_SUCCESS: u16 = 200;

/// A message delivered by the broker, detached from the client library.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub headers: BTreeMap<ShortString, AMQPValue>,
}

/// Stream of deliveries produced by a `basic.consume`.
pub type DeliveryStream = BoxStream<'static, Result<InboundMessage, AmqpError>>;

/// The channel operations the framework relies on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Starts a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;

    fn is_connection_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Source of fresh channels, implemented by the connection manager.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Opens a new channel, connecting first if needed.
    async fn acquire_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    fn is_connected(&self) -> bool;

    /// Closes the underlying connection, if any.
    async fn close(&self);
}

/// [`AmqpChannel`] backed by a lapin channel.
///
/// The connection is kept alongside the channel so its liveness can be
/// reported and so it outlives every channel opened on it.
pub struct LapinChannel {
    connection: Arc<Connection>,
    channel: Channel,
}

impl LapinChannel {
    pub fn new(connection: Arc<Connection>, channel: Channel) -> Self {
        LapinChannel {
            connection,
            channel,
        }
    }

    pub(crate) async fn open(connection: Arc<Connection>) -> Result<Self, AmqpError> {
        debug!("creating amqp channel...");
        match connection.create_channel().await {
            Ok(channel) => {
                debug!(id = channel.id(), "channel created");
                Ok(LapinChannel::new(connection, channel))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(name, kind, options, arguments)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the exchange");
                AmqpError::DeclareExchangeError(name.to_owned())
            })
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        match self.channel.queue_declare(name, options, arguments).await {
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            Ok(_) => Ok(()),
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError(err.to_string())
            })?;

        match confirm.await {
            Ok(c) if c.is_nack() => Err(AmqpError::PublishingError(
                "publisher confirm nack".to_owned(),
            )),
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error awaiting publisher confirm");
                Err(AmqpError::PublishingError(err.to_string()))
            }
        }
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(err.to_string()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(InboundMessage {
                    delivery_tag: delivery.delivery_tag,
                    exchange: delivery.exchange.to_string(),
                    routing_key: delivery.routing_key.to_string(),
                    redelivered: delivery.redelivered,
                    headers: delivery
                        .properties
                        .headers()
                        .as_ref()
                        .map(|h| h.inner().clone())
                        .unwrap_or_default(),
                    data: delivery.data,
                }),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error while acking msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error while nacking msg");
                AmqpError::NackMessageError
            })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| AmqpError::ConsumerError(err.to_string()))
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    fn is_connection_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "channel released")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error closing channel");
                AmqpError::ChannelError(err.to_string())
            })
    }
}
