// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! [`RabbitMQConsumer`] ties a subscription to a handler. Construction
//! acquires a channel and declares the subscription topology; [`run`] then
//! consumes with manual acknowledgement until shutdown is signalled.
//!
//! Each delivery goes through the [`RetryExecutor`]. A success is acked; an
//! exhausted message is counted as a failure and settled by the
//! [`DeadLetterRouter`]; a message whose retry wait was cut short by shutdown
//! is requeued. Messages are handled one at a time, so the ack or nack of a
//! delivery is issued only after its whole retry sequence is over.
//!
//! [`run`]: RabbitMQConsumer::run

use crate::{
    channel::{AmqpChannel, ChannelProvider, DeliveryStream, InboundMessage},
    dead_letter::{AckDecision, DeadLetterRouter},
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage},
    health::{HealthSnapshot, HealthTracker},
    otel,
    retry::{RetryExecutor, RetryOutcome},
    subscription::{ConsumerOptions, SubscriptionConfig},
    topology::TopologyBuilder,
};
use futures_util::StreamExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// Lifecycle of a consumer. `ProcessingMessage` is entered for every delivery
/// and left back to `Consuming`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Initializing,
    TopologySetup,
    Consuming,
    ProcessingMessage,
    Stopping,
    Stopped,
}

/// Signals a consumer to stop. Cloneable and usable from any task.
#[derive(Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Stops accepting deliveries and interrupts pending retry waits. A
    /// handler invocation already running is allowed to finish.
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
    }
}

pub struct RabbitMQConsumer {
    name: String,
    subscription: SubscriptionConfig,
    prefetch_count: u16,
    reconnect_delay: Duration,
    provider: Arc<dyn ChannelProvider>,
    channel: Mutex<Arc<dyn AmqpChannel>>,
    handler: Arc<dyn ConsumerHandler>,
    retry: RetryExecutor,
    dead_letter: DeadLetterRouter,
    health: HealthTracker,
    state: watch::Sender<ConsumerState>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl RabbitMQConsumer {
    /// Validates the options, acquires a channel and declares the
    /// subscription topology.
    ///
    /// Any failure here is fatal for the subscription: configuration errors
    /// are returned before contacting the broker, connection and topology
    /// errors as they occur.
    pub async fn new(
        provider: Arc<dyn ChannelProvider>,
        options: ConsumerOptions,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<RabbitMQConsumer, AmqpError> {
        let subscription = options.subscription()?;
        let name = options
            .consumer_name
            .clone()
            .unwrap_or_else(|| format!("{}-consumer", subscription.queue_name()));
        let dead_letter = options.dead_letter()?;

        let (state, _) = watch::channel(ConsumerState::Initializing);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let channel = provider.acquire_channel().await?;

        state.send_replace(ConsumerState::TopologySetup);
        if let Err(err) =
            TopologyBuilder::ensure_consumer_topology(channel.as_ref(), &subscription, &dead_letter)
                .await
        {
            error!(
                consumer = name,
                error = err.to_string(),
                "failure to declare consumer topology"
            );
            let _ = channel.close().await;
            return Err(err);
        }

        let health = HealthTracker::new();
        health.set_connection_state(channel.is_connection_open(), channel.is_open());

        info!(
            consumer = name,
            queue = subscription.queue_name(),
            dead_letter = dead_letter.enabled,
            "consumer ready"
        );

        Ok(RabbitMQConsumer {
            retry: RetryExecutor::new(options.retry_policy(), shutdown_rx),
            dead_letter: DeadLetterRouter::new(dead_letter, name.clone()),
            name,
            subscription,
            prefetch_count: options.prefetch_count,
            reconnect_delay: options.reconnect_delay,
            provider,
            channel: Mutex::new(channel),
            handler,
            health,
            state,
            shutdown: Arc::new(shutdown),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscription(&self) -> &SubscriptionConfig {
        &self.subscription
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Receiver observing every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            sender: self.shutdown.clone(),
        }
    }

    /// Current health, re-evaluated against the live connection and channel.
    pub fn health_snapshot(&self) -> HealthSnapshot {
        let channel = self.current_channel();
        self.health
            .evaluate(channel.is_connection_open(), channel.is_open());
        self.health.snapshot()
    }

    /// Runs [`run`](Self::run) on a dedicated task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<Result<(), AmqpError>> {
        tokio::spawn(async move { self.run().await })
    }

    /// Consumes until shutdown, then cancels the subscription and releases
    /// the consumer's channel. The connection belongs to the provider, which
    /// may be shared with other consumers and publishers, and stays open.
    ///
    /// If the broker ends the subscription, the consumer waits
    /// `reconnect_delay`, reacquires a channel, redeclares its topology and
    /// subscribes again, until it succeeds or shutdown is signalled.
    pub async fn run(&self) -> Result<(), AmqpError> {
        if self.state() != ConsumerState::TopologySetup {
            return Err(AmqpError::ConsumerError(format!(
                "consumer `{}` cannot start from state {:?}",
                self.name,
                self.state()
            )));
        }

        let mut shutdown = self.shutdown.subscribe();
        let mut channel = self.current_channel();

        let mut deliveries = match self.subscribe(channel.as_ref()).await {
            Ok(d) => d,
            Err(err) => {
                self.stop(channel.as_ref()).await;
                return Err(err);
            }
        };

        self.state.send_replace(ConsumerState::Consuming);
        info!(consumer = self.name, queue = self.subscription.queue_name(), "consuming");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => continue,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.process(channel.as_ref(), delivery).await,
                Some(Err(err)) => {
                    error!(consumer = self.name, error = err.to_string(), "errors consume msg");
                }
                None => {
                    warn!(consumer = self.name, "delivery stream ended");
                    self.health
                        .set_connection_state(channel.is_connection_open(), false);

                    match self.resubscribe(&mut shutdown).await {
                        Some((c, d)) => {
                            channel = c;
                            deliveries = d;
                        }
                        None => break,
                    }
                }
            }
        }

        drop(deliveries);
        self.stop(channel.as_ref()).await;
        Ok(())
    }

    fn current_channel(&self) -> Arc<dyn AmqpChannel> {
        self.channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn subscribe(&self, channel: &dyn AmqpChannel) -> Result<DeliveryStream, AmqpError> {
        channel.qos(self.prefetch_count).await?;
        let deliveries = channel
            .consume(self.subscription.queue_name(), &self.name)
            .await?;

        self.health
            .set_connection_state(channel.is_connection_open(), channel.is_open());

        Ok(deliveries)
    }

    async fn resubscribe(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<(Arc<dyn AmqpChannel>, DeliveryStream)> {
        loop {
            let interrupted = tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => false,
                _ = signalled(shutdown) => true,
            };
            if interrupted {
                return None;
            }

            match self.reconnect().await {
                Ok(subscribed) => return Some(subscribed),
                Err(err) => warn!(
                    consumer = self.name,
                    error = err.to_string(),
                    "failure to resubscribe, retrying"
                ),
            }
        }
    }

    async fn reconnect(&self) -> Result<(Arc<dyn AmqpChannel>, DeliveryStream), AmqpError> {
        let channel = self.provider.acquire_channel().await?;

        let subscribed = async {
            TopologyBuilder::ensure_consumer_topology(
                channel.as_ref(),
                &self.subscription,
                self.dead_letter.config(),
            )
            .await?;
            self.subscribe(channel.as_ref()).await
        }
        .await;

        let deliveries = match subscribed {
            Ok(d) => d,
            Err(err) => {
                let _ = channel.close().await;
                return Err(err);
            }
        };

        let previous = std::mem::replace(
            &mut *self.channel.lock().unwrap_or_else(PoisonError::into_inner),
            channel.clone(),
        );
        let _ = previous.close().await;

        info!(consumer = self.name, "resubscribed");
        Ok((channel, deliveries))
    }

    async fn process(&self, channel: &dyn AmqpChannel, delivery: InboundMessage) {
        self.state.send_replace(ConsumerState::ProcessingMessage);

        let queue = self.subscription.queue_name();
        let tracer = global::tracer("amqp consumer");
        let (ctx, mut span) = otel::new_span(&delivery.headers, &tracer, queue);

        debug!(
            queue,
            routing_key = delivery.routing_key,
            redelivered = delivery.redelivered,
            "received"
        );

        let msg = ConsumerMessage::new(queue, &delivery.routing_key, &delivery.data);

        let decision = match self.retry.run(self.handler.as_ref(), &ctx, &msg).await {
            RetryOutcome::Success { .. } => {
                self.health.record_success();
                span.set_status(Status::Ok);
                AckDecision::Ack
            }
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                self.health.record_failure();
                span.record_error(&last_error);
                span.set_status(Status::Error {
                    description: Cow::from(last_error.to_string()),
                });

                self.dead_letter
                    .handle_exhausted(
                        channel,
                        &delivery.data,
                        &delivery.routing_key,
                        &last_error,
                        attempts.saturating_sub(1),
                    )
                    .await
            }
            RetryOutcome::Interrupted { .. } => {
                span.set_status(Status::Error {
                    description: Cow::from("interrupted by shutdown"),
                });
                AckDecision::Requeue
            }
        };

        self.settle(channel, delivery.delivery_tag, decision).await;
        span.end();

        self.state.send_replace(ConsumerState::Consuming);
    }

    async fn settle(&self, channel: &dyn AmqpChannel, delivery_tag: u64, decision: AckDecision) {
        let result = match decision {
            AckDecision::Ack => channel.ack(delivery_tag).await,
            AckDecision::RejectWithoutRequeue => channel.nack(delivery_tag, false).await,
            AckDecision::Requeue => channel.nack(delivery_tag, true).await,
        };

        if let Err(err) = result {
            error!(
                consumer = self.name,
                delivery_tag,
                decision = ?decision,
                error = err.to_string(),
                "failure to settle message"
            );
        }
    }

    async fn stop(&self, channel: &dyn AmqpChannel) {
        self.state.send_replace(ConsumerState::Stopping);
        info!(consumer = self.name, "stopping consumer");

        if channel.is_open() {
            if let Err(err) = channel.cancel(&self.name).await {
                debug!(error = err.to_string(), "failure to cancel consumer");
            }
        }
        if let Err(err) = channel.close().await {
            debug!(error = err.to_string(), "failure to close consumer channel");
        }

        self.health.set_connection_state(false, false);
        self.state.send_replace(ConsumerState::Stopped);
        info!(consumer = self.name, "consumer stopped");
    }
}

/// Resolves once shutdown is signalled. Never resolves if it no longer can be.
async fn signalled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
