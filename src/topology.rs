// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! [`AmqpTopology`] collects exchanges, queues and bindings and installs them
//! on a channel in a deterministic order: exchanges, then queues, then
//! bindings, each in insertion order. [`TopologyBuilder`] assembles the
//! topology a consumer subscription or a publish call needs, including the
//! dead-letter exchange/queue pair. Every declaration is idempotent, so
//! installing the same topology twice is harmless.

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    subscription::{DeadLetterConfig, SubscriptionConfig},
};
use async_trait::async_trait;
use tracing::debug;

/// Interface for registering topology components and installing them.
#[async_trait]
pub trait Topology {
    fn exchange(self, def: ExchangeDefinition) -> Self;

    fn queue(self, def: QueueDefinition) -> Self;

    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Declares every registered component on the broker.
    async fn install(&self) -> Result<(), AmqpError>;
}

pub struct AmqpTopology<'tp> {
    channel: &'tp dyn AmqpChannel,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(channel: &'tp dyn AmqpChannel) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }
}

#[async_trait]
impl Topology for AmqpTopology<'_> {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        if !self.exchanges.iter().any(|e| e.name == def.name) {
            self.exchanges.push(def);
        }
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        if !self.queues.iter().any(|q| q.name == def.name) {
            self.queues.push(def);
        }
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        if !self.queues_binding.contains(&binding) {
            self.queues_binding.push(binding);
        }
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queues().await
    }
}

impl AmqpTopology<'_> {
    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            self.channel
                .declare_exchange(
                    &exch.name,
                    (&exch.kind).into(),
                    exch.options(),
                    exch.arguments(),
                )
                .await?;

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            self.channel
                .declare_queue(&def.name, def.options(), def.arguments())
                .await?;

            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            self.channel
                .bind_queue(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                )
                .await?;
        }

        Ok(())
    }
}

/// Declares the topology required by consumers and publish calls.
pub struct TopologyBuilder;

impl TopologyBuilder {
    /// Declares what a consumer subscription needs before consumption starts.
    ///
    /// In simple-queue mode this is the queue; in exchange mode the direct
    /// exchange, the queue and their binding on the routing key. With
    /// dead-lettering enabled the queue points at the dead-letter exchange,
    /// and the dead-letter exchange, queue and `.failed` binding are declared
    /// as well.
    pub async fn ensure_consumer_topology(
        channel: &dyn AmqpChannel,
        subscription: &SubscriptionConfig,
        dead_letter: &DeadLetterConfig,
    ) -> Result<(), AmqpError> {
        let mut topology = AmqpTopology::new(channel);

        if dead_letter.enabled {
            topology = Self::with_dead_letter(topology, dead_letter);
        }

        topology = Self::with_subscription(topology, subscription, dead_letter);

        topology.install().await
    }

    /// Declares the destination of a publish call.
    ///
    /// The queue is declared with the same arguments a consumer of the same
    /// subscription declares it with, otherwise the broker rejects the second
    /// declaration. The dead-letter pair itself is left to the consumer.
    pub async fn ensure_publish_topology(
        channel: &dyn AmqpChannel,
        target: &SubscriptionConfig,
        dead_letter_enabled: bool,
    ) -> Result<(), AmqpError> {
        let dead_letter = DeadLetterConfig::for_subscription(target, dead_letter_enabled);

        Self::with_subscription(AmqpTopology::new(channel), target, &dead_letter)
            .install()
            .await
    }

    fn with_dead_letter<'tp>(
        topology: AmqpTopology<'tp>,
        dead_letter: &DeadLetterConfig,
    ) -> AmqpTopology<'tp> {
        topology
            .exchange(ExchangeDefinition::new(&dead_letter.exchange).direct())
            .queue(QueueDefinition::new(&dead_letter.queue))
            .queue_binding(
                QueueBinding::new(&dead_letter.queue)
                    .exchange(&dead_letter.exchange)
                    .routing_key(&dead_letter.routing_key),
            )
    }

    fn with_subscription<'tp>(
        topology: AmqpTopology<'tp>,
        subscription: &SubscriptionConfig,
        dead_letter: &DeadLetterConfig,
    ) -> AmqpTopology<'tp> {
        let mut queue = QueueDefinition::new(subscription.queue_name());
        if dead_letter.enabled {
            queue = queue.dead_letter(&dead_letter.exchange, &dead_letter.routing_key);
        }

        match subscription {
            SubscriptionConfig::Queue { .. } => topology.queue(queue),
            SubscriptionConfig::Exchange {
                exchange_name,
                routing_key,
                queue_name,
            } => topology
                .exchange(ExchangeDefinition::new(exchange_name).direct())
                .queue(queue)
                .queue_binding(
                    QueueBinding::new(queue_name)
                        .exchange(exchange_name)
                        .routing_key(routing_key),
                ),
        }
    }
}
