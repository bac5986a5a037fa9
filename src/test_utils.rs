// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.
//!
//! `FakeBroker` implements the connector/connection/channel traits and keeps
//! everything a real broker would: declared exchanges and queues, bindings,
//! published messages and active subscriptions. It can be taken offline to
//! simulate outages and can drop every open connection at once, which also
//! ends the delivery streams of its consumers.

use crate::{
    channel::{AmqpChannel, AmqpConnection, AmqpConnector, DeliveryStream},
    consumer::InFlightDelivery,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{types::FieldTable, BasicProperties};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::mpsc;

type DeliverySender = mpsc::UnboundedSender<Result<Arc<dyn InFlightDelivery>, AmqpError>>;

/// Close calls in the order the broker received them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Closed {
    Channel,
    Connection,
}

#[derive(Debug, Clone)]
pub(crate) struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: BasicProperties,
}

#[derive(Debug, Default)]
pub(crate) struct BrokerState {
    pub available: bool,
    pub generation: u64,
    pub connect_attempts: u32,
    pub connects: u32,
    pub failing_connects: u32,
    pub failing_publishes: u32,
    pub publish_attempts: u32,
    pub closed_connections: u32,
    pub closed_channels: u32,
    pub exchanges: BTreeMap<String, ExchangeKind>,
    pub queues: BTreeMap<String, FieldTable>,
    pub bindings: BTreeSet<(String, String, String)>,
    pub published: Vec<PublishedMessage>,
    pub refused: Vec<PublishedMessage>,
    pub prefetch: Option<u16>,
    pub consumer_tags: Vec<String>,
    pub subscribers: Vec<DeliverySender>,
    pub failing_closes: bool,
    pub closes: Vec<Closed>,
}

impl BrokerState {
    fn drop_connections(&mut self) {
        self.generation += 1;
        self.subscribers.clear();
    }

    fn record_close(&mut self, closed: Closed) -> Result<(), AmqpError> {
        self.closes.push(closed);
        match closed {
            Closed::Channel => self.closed_channels += 1,
            Closed::Connection => self.closed_connections += 1,
        }

        match (self.failing_closes, closed) {
            (false, _) => Ok(()),
            (true, Closed::Channel) => Err(AmqpError::ChannelError),
            (true, Closed::Connection) => Err(AmqpError::ConnectionError),
        }
    }
}

#[derive(Clone)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub fn new() -> FakeBroker {
        FakeBroker {
            state: Arc::new(Mutex::new(BrokerState {
                available: true,
                ..BrokerState::default()
            })),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub fn connector(&self) -> Arc<dyn AmqpConnector> {
        Arc::new(self.clone())
    }

    /// Taking the broker offline also drops every open connection.
    pub fn set_available(&self, available: bool) {
        let mut state = self.state();
        state.available = available;
        if !available {
            state.drop_connections();
        }
    }

    pub fn drop_connections(&self) {
        self.state().drop_connections();
    }

    /// Every close call fails from now on, after being recorded.
    pub fn fail_closes(&self) {
        self.state().failing_closes = true;
    }

    /// Hands `delivery` to the oldest live subscriber. Returns `false` when
    /// nobody is consuming.
    pub fn deliver(&self, delivery: Arc<FakeDelivery>) -> bool {
        let mut state = self.state();
        state.subscribers.retain(|tx| !tx.is_closed());

        match state.subscribers.first() {
            Some(tx) => tx
                .send(Ok(delivery as Arc<dyn InFlightDelivery>))
                .is_ok(),
            None => false,
        }
    }

    /// Refuses the next `count` connection attempts, as a stopped broker would.
    pub fn fail_next_connects(&self, count: u32) {
        self.state().failing_connects = count;
    }

    pub fn fail_next_publishes(&self, count: u32) {
        self.state().failing_publishes = count;
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }
}

#[async_trait]
impl AmqpConnector for FakeBroker {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        let mut state = self.state();
        state.connect_attempts += 1;

        if !state.available {
            return Err(AmqpError::ConnectionError);
        }

        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(AmqpError::ConnectionError);
        }

        state.connects += 1;
        Ok(Arc::new(FakeConnection {
            state: self.state.clone(),
            generation: state.generation,
            closed: AtomicBool::new(false),
        }))
    }
}

pub(crate) struct FakeConnection {
    state: Arc<Mutex<BrokerState>>,
    generation: u64,
    closed: AtomicBool,
}

#[async_trait]
impl AmqpConnection for FakeConnection {
    fn is_open(&self) -> bool {
        let state = self.state.lock().unwrap();
        !self.closed.load(Ordering::SeqCst) && state.generation == self.generation
    }

    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::ChannelError);
        }

        Ok(Arc::new(FakeChannel {
            state: self.state.clone(),
            generation: self.generation,
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);
        self.state.lock().unwrap().record_close(Closed::Connection)
    }
}

pub(crate) struct FakeChannel {
    state: Arc<Mutex<BrokerState>>,
    generation: u64,
}

impl FakeChannel {
    fn live_state(&self) -> Option<MutexGuard<'_, BrokerState>> {
        let state = self.state.lock().unwrap();
        (state.available && state.generation == self.generation).then_some(state)
    }
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition<'_>) -> Result<(), AmqpError> {
        let error = AmqpError::DeclareExchangeError(def.name().to_owned());
        let mut state = self.live_state().ok_or(error.clone())?;

        match state.exchanges.get(def.name()) {
            Some(kind) if *kind != def.exchange_kind() => Err(error),
            _ => {
                state
                    .exchanges
                    .insert(def.name().to_owned(), def.exchange_kind());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let error = AmqpError::DeclareQueueError(def.name().to_owned());
        let mut state = self.live_state().ok_or(error.clone())?;
        let args = def.arguments();

        match state.queues.get(def.name()) {
            Some(existing) if *existing != args => Err(error),
            _ => {
                state.queues.insert(def.name().to_owned(), args);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        let error = AmqpError::BindingExchangeToQueueError(
            binding.exchange_name().to_owned(),
            binding.queue_name().to_owned(),
        );
        let mut state = self.live_state().ok_or(error.clone())?;

        if !state.exchanges.contains_key(binding.exchange_name())
            || !state.queues.contains_key(binding.queue_name())
        {
            return Err(error);
        }

        state.bindings.insert((
            binding.exchange_name().to_owned(),
            binding.queue_name().to_owned(),
            binding.key().to_owned(),
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
        let mut state = self.live_state().ok_or(AmqpError::PublishingError)?;
        state.publish_attempts += 1;

        let message = PublishedMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: payload.to_vec(),
            properties,
        };

        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            state.refused.push(message);
            return Err(AmqpError::PublishingError);
        }

        state.published.push(message);
        Ok(())
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        let mut state = self
            .live_state()
            .ok_or(AmqpError::QoSDeclarationError(prefetch_count.to_string()))?;
        state.prefetch = Some(prefetch_count);
        Ok(())
    }

    async fn consume(
        &self,
        _queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self
            .live_state()
            .ok_or(AmqpError::ConsumerDeclarationError)?;

        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push(tx);
        state.consumer_tags.push(consumer_tag.to_owned());

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.state.lock().unwrap().record_close(Closed::Channel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Acked,
    Rejected,
}

/// Delivery double recording how the consumer settled it.
pub(crate) struct FakeDelivery {
    routing_key: String,
    data: Vec<u8>,
    properties: BasicProperties,
    settlements: Mutex<Vec<Settlement>>,
}

impl FakeDelivery {
    pub fn new(routing_key: &str, data: Vec<u8>, properties: BasicProperties) -> FakeDelivery {
        FakeDelivery {
            routing_key: routing_key.to_owned(),
            data,
            properties,
            settlements: Mutex::new(vec![]),
        }
    }

    /// Redelivers a message the consumer republished.
    pub fn from_published(message: &PublishedMessage) -> FakeDelivery {
        FakeDelivery::new(
            &message.routing_key,
            message.payload.clone(),
            message.properties.clone(),
        )
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.settlements.lock().unwrap().clone()
    }
}

#[async_trait]
impl InFlightDelivery for FakeDelivery {
    fn routing_key(&self) -> &str {
        &self.routing_key
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    async fn ack(&self) -> Result<(), AmqpError> {
        self.settlements.lock().unwrap().push(Settlement::Acked);
        Ok(())
    }

    async fn reject(&self) -> Result<(), AmqpError> {
        self.settlements.lock().unwrap().push(Settlement::Rejected);
        Ok(())
    }
}
