// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.
//!
//! Routes publishes through declared exchanges and bindings (the default
//! exchange routes to the queue named by the routing key), hands deliveries to
//! active consumers and records every declaration, publish, ack and nack.

use crate::{
    channel::{AmqpChannel, ChannelProvider, DeliveryStream, InboundMessage},
    errors::AmqpError,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    options::{ExchangeDeclareOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, ExchangeKind,
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Declaration {
    Exchange(String),
    Queue(String),
    /// queue, exchange, routing key
    Binding(String, String, String),
}

#[derive(Debug, Clone)]
pub(crate) struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
}

type DeliverySender = mpsc::UnboundedSender<Result<InboundMessage, AmqpError>>;

struct ActiveConsumer {
    tag: String,
    channel_id: usize,
    sender: DeliverySender,
}

#[derive(Default)]
struct QueueState {
    arguments: FieldTable,
    pending: VecDeque<InboundMessage>,
    consumer: Option<ActiveConsumer>,
}

#[derive(Default)]
struct BrokerState {
    declarations: Vec<Declaration>,
    queues: HashMap<String, QueueState>,
    exchanges: HashSet<String>,
    bindings: Vec<(String, String, String)>,
    published: Vec<Published>,
    unacked: HashMap<u64, (String, InboundMessage)>,
    acked: Vec<u64>,
    nacked: Vec<(u64, bool)>,
    next_tag: u64,
    connected: bool,
    refuse_connections: bool,
    failing_exchanges: HashSet<String>,
    channels: Vec<Arc<AtomicBool>>,
    channels_closed: usize,
    connections_closed: usize,
}

impl BrokerState {
    fn declare(&mut self, declaration: Declaration) {
        if !self.declarations.contains(&declaration) {
            self.declarations.push(declaration);
        }
    }

    fn route(&mut self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default();
        }

        self.bindings
            .iter()
            .filter(|(_, ex, rk)| ex == exchange && rk == routing_key)
            .map(|(queue, _, _)| queue.clone())
            .collect()
    }

    fn deliver(&mut self, queue: &str, mut message: InboundMessage) {
        self.next_tag += 1;
        message.delivery_tag = self.next_tag;
        self.unacked
            .insert(message.delivery_tag, (queue.to_owned(), message.clone()));

        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };

        let undelivered = match &state.consumer {
            Some(consumer) => consumer.sender.send(Ok(message)).err().and_then(|e| e.0.ok()),
            None => Some(message),
        };

        if let Some(message) = undelivered {
            state.consumer = None;
            state.pending.push_back(message);
        }
    }

    fn drop_consumers(&mut self, channel_id: Option<usize>) {
        for state in self.queues.values_mut() {
            let owned = state
                .consumer
                .as_ref()
                .map(|c| channel_id.is_none() || channel_id == Some(c.channel_id))
                .unwrap_or(false);
            if owned {
                state.consumer = None;
            }
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        MemoryBroker::default()
    }

    pub fn channel(&self) -> MemoryChannel {
        let mut state = self.state.lock().unwrap();
        let open = Arc::new(AtomicBool::new(true));
        state.channels.push(open.clone());
        state.connected = true;

        MemoryChannel {
            id: state.channels.len(),
            open,
            state: self.state.clone(),
        }
    }

    pub fn declarations(&self) -> Vec<Declaration> {
        self.state.lock().unwrap().declarations.clone()
    }

    pub fn queue_arguments(&self, queue: &str) -> Option<FieldTable> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.arguments.clone())
    }

    /// Messages waiting in `queue` without a consumer.
    pub fn pending(&self, queue: &str) -> Vec<InboundMessage> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.pending.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn published_to(&self, exchange: &str) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| p.exchange == exchange)
            .collect()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.state.lock().unwrap().acked.clone()
    }

    pub fn nacked(&self) -> Vec<(u64, bool)> {
        self.state.lock().unwrap().nacked.clone()
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.consumer.is_some())
            .unwrap_or(false)
    }

    pub fn channels_opened(&self) -> usize {
        self.state.lock().unwrap().channels.len()
    }

    pub fn channels_closed(&self) -> usize {
        self.state.lock().unwrap().channels_closed
    }

    pub fn connections_closed(&self) -> usize {
        self.state.lock().unwrap().connections_closed
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_connections = refuse;
    }

    /// Makes every publish to `exchange` fail.
    pub fn fail_publishing_to(&self, exchange: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_exchanges
            .insert(exchange.to_owned());
    }

    /// Closes every open channel from the broker side, ending their consumers.
    pub fn break_channels(&self) {
        let mut state = self.state.lock().unwrap();
        for open in &state.channels {
            open.store(false, Ordering::SeqCst);
        }
        state.drop_consumers(None);
    }
}

#[async_trait]
impl ChannelProvider for MemoryBroker {
    async fn acquire_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if self.state.lock().unwrap().refuse_connections {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        Ok(Arc::new(self.channel()))
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    async fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.connected = false;
        state.connections_closed += 1;
    }
}

pub(crate) struct MemoryChannel {
    id: usize,
    open: Arc<AtomicBool>,
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AmqpError::ChannelError("channel closed".to_owned()))
        }
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        _kind: ExchangeKind,
        _options: ExchangeDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();
        state.exchanges.insert(name.to_owned());
        state.declare(Declaration::Exchange(name.to_owned()));
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        _options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();

        if let Some(existing) = state.queues.get(name) {
            if existing.arguments != arguments {
                return Err(AmqpError::DeclareQueueError(name.to_owned()));
            }
        }

        state.queues.entry(name.to_owned()).or_default().arguments = arguments;
        state.declare(Declaration::Queue(name.to_owned()));
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();

        if !state.queues.contains_key(queue) || !state.exchanges.contains(exchange) {
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }

        let binding = (queue.to_owned(), exchange.to_owned(), routing_key.to_owned());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        state.declare(Declaration::Binding(
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
        ));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();

        if state.failing_exchanges.contains(exchange) {
            return Err(AmqpError::PublishingError(format!("{exchange} unavailable")));
        }

        state.published.push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data: payload.to_vec(),
            properties: properties.clone(),
        });

        let message = InboundMessage {
            delivery_tag: 0,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            data: payload.to_vec(),
            headers: properties
                .headers()
                .as_ref()
                .map(|h| h.inner().clone())
                .unwrap_or_default(),
        };

        for queue in state.route(exchange, routing_key) {
            state.deliver(&queue, message.clone());
        }

        Ok(())
    }

    async fn qos(&self, _prefetch_count: u16) -> Result<(), AmqpError> {
        self.ensure_open()
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();

        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(AmqpError::ConsumerDeclarationError(format!("no queue `{queue}`")));
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        while let Some(message) = queue_state.pending.pop_front() {
            let _ = sender.send(Ok(message));
        }
        queue_state.consumer = Some(ActiveConsumer {
            tag: consumer_tag.to_owned(),
            channel_id: self.id,
            sender,
        });

        Ok(stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.ensure_open().map_err(|_| AmqpError::AckMessageError)?;
        let mut state = self.state.lock().unwrap();
        state.unacked.remove(&delivery_tag);
        state.acked.push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.ensure_open().map_err(|_| AmqpError::NackMessageError)?;
        let mut state = self.state.lock().unwrap();
        state.nacked.push((delivery_tag, requeue));

        let Some((queue, mut message)) = state.unacked.remove(&delivery_tag) else {
            return Ok(());
        };

        // requeued messages wait for the next consumer
        if requeue {
            message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&queue) {
                q.pending.push_back(message);
            }
        }

        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();
        for queue in state.queues.values_mut() {
            if queue.consumer.as_ref().map(|c| c.tag == consumer_tag).unwrap_or(false) {
                queue.consumer = None;
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn is_connection_open(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.open.swap(false, Ordering::SeqCst) {
            let mut state = self.state.lock().unwrap();
            state.channels_closed += 1;
            state.drop_consumers(Some(self.id));
        }
        Ok(())
    }
}
