// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module provides functionality for defining and creating the broker
//! topology used by task events. The topology includes exchanges, queues, and
//! the bindings between them, with the main queue dead-lettering rejected
//! messages into a Dead Letter Queue (DLQ).
//!
//! The main components are:
//! - `Topology` trait: Interface for topology management
//! - `AmqpTopology`: Implementation of the Topology trait over an [`AmqpChannel`]
//! - `TopologyInitializer`: Declares the task event topology with retries

use crate::{
    channel::{AmqpChannel, AmqpConnector},
    config::RabbitMQConfig,
    errors::AmqpError,
    events::DLQ_ROUTING_KEY,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    retry::{retry_with_backoff, RetryPolicy},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Trait defining the interface for topology management.
///
/// This trait provides methods for registering exchanges, queues, and bindings,
/// as well as installing the topology to the RabbitMQ server.
#[async_trait]
pub trait Topology<'tp> {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: &'tp ExchangeDefinition<'tp>) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: &'tp QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: &'tp QueueBinding<'tp>) -> Self;

    /// Installs the topology to the RabbitMQ server.
    ///
    /// This creates all the exchanges and queues, and sets up all the bindings.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
///
/// Declarations are idempotent on the broker side: installing the same
/// topology twice leaves a single copy of every exchange, queue and binding.
pub struct AmqpTopology<'tp> {
    channel: Arc<dyn AmqpChannel>,
    pub(crate) exchanges: Vec<&'tp ExchangeDefinition<'tp>>,
    pub(crate) queues: Vec<&'tp QueueDefinition>,
    pub(crate) queues_binding: Vec<&'tp QueueBinding<'tp>>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(channel: Arc<dyn AmqpChannel>) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn exchange(mut self, def: &'tp ExchangeDefinition<'tp>) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: &'tp QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: &'tp QueueBinding<'tp>) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology to the RabbitMQ server.
    ///
    /// This method performs the following operations in order:
    /// 1. Creates all exchanges
    /// 2. Creates all queues
    /// 3. Sets up queue-to-exchange bindings
    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchanges().await?;
        self.install_queues().await?;
        self.binding_queues().await
    }
}

impl<'tp> AmqpTopology<'tp> {
    async fn install_exchanges(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            self.channel.declare_exchange(exch).await?;
        }

        Ok(())
    }

    async fn install_queues(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            self.channel.declare_queue(def).await?;
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            self.channel.bind_queue(binding).await?;
        }

        debug!("queues were bound");

        Ok(())
    }
}

/// Declares the task event topology on the broker.
///
/// Every broker failure during a declaration round is retried according to
/// the policy (3 retries waiting 2s, 4s and 8s by default). A fresh
/// connection is opened for each round and closed afterwards.
pub struct TopologyInitializer {
    connector: Arc<dyn AmqpConnector>,
    cfg: RabbitMQConfig,
    policy: RetryPolicy,
}

impl TopologyInitializer {
    pub fn new(connector: Arc<dyn AmqpConnector>, cfg: RabbitMQConfig) -> TopologyInitializer {
        TopologyInitializer {
            connector,
            cfg,
            policy: RetryPolicy::topology(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Declares exchanges, queues and bindings. Safe to call repeatedly.
    ///
    /// An empty routing key set fails immediately, before touching the broker.
    pub async fn initialize(&self) -> Result<(), AmqpError> {
        self.check_routing_keys()?;

        retry_with_backoff(&self.policy, "declare topology", || self.declare()).await?;

        info!(
            exchange = %self.cfg.exchange,
            queue = %self.cfg.queue,
            dlx_exchange = %self.cfg.dlx_exchange,
            dlq_queue = %self.cfg.dlq_queue,
            routing_keys = ?self.cfg.routing_keys,
            "topology initialized"
        );

        Ok(())
    }

    /// Runs [`TopologyInitializer::initialize`] under an outer policy, used
    /// by the hosting process before it starts consuming.
    ///
    /// # Example
    /// ```ignore
    /// initializer.initialize_with_startup_retry(&RetryPolicy::startup()).await?;
    /// ```
    pub async fn initialize_with_startup_retry(
        &self,
        startup: &RetryPolicy,
    ) -> Result<(), AmqpError> {
        self.check_routing_keys()?;

        retry_with_backoff(startup, "initialize topology", || self.initialize()).await
    }

    fn check_routing_keys(&self) -> Result<(), AmqpError> {
        if self.cfg.routing_keys.is_empty() {
            error!(queue = %self.cfg.queue, "no routing key configured for the main queue");
            return Err(AmqpError::MissingRoutingKeys);
        }
        Ok(())
    }

    async fn declare(&self) -> Result<(), AmqpError> {
        let conn = self.connector.connect().await?;

        let result = match conn.open_channel().await {
            Ok(channel) => {
                let installed = self.install(channel.clone()).await;
                if let Err(err) = channel.close().await {
                    debug!(error = %err, "failure to close topology channel");
                }
                installed
            }
            Err(err) => Err(err),
        };

        if let Err(err) = conn.close().await {
            debug!(error = %err, "failure to close topology connection");
        }

        result
    }

    async fn install(&self, channel: Arc<dyn AmqpChannel>) -> Result<(), AmqpError> {
        let cfg = &self.cfg;

        let exchange = ExchangeDefinition::new(&cfg.exchange).topic().durable();
        let dlx = ExchangeDefinition::new(&cfg.dlx_exchange).topic().durable();

        let queue = QueueDefinition::new(&cfg.queue)
            .durable()
            .dead_letter(&cfg.dlx_exchange, DLQ_ROUTING_KEY);
        let dlq = QueueDefinition::new(&cfg.dlq_queue).durable();

        let bindings: Vec<QueueBinding> = cfg
            .routing_keys
            .iter()
            .map(|key| {
                QueueBinding::new(&cfg.queue)
                    .exchange(&cfg.exchange)
                    .routing_key(key)
            })
            .collect();
        let dlq_binding = QueueBinding::new(&cfg.dlq_queue)
            .exchange(&cfg.dlx_exchange)
            .routing_key(DLQ_ROUTING_KEY);

        let topology = AmqpTopology::new(channel)
            .exchange(&exchange)
            .exchange(&dlx)
            .queue(&queue)
            .queue(&dlq)
            .queue_binding(&dlq_binding);

        bindings
            .iter()
            .fold(topology, |topology, binding| topology.queue_binding(binding))
            .install()
            .await
    }
}
