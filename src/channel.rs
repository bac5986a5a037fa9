// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module handles the creation and management of AMQP connections and
//! channels. Broker access goes through three small traits:
//!
//! - [`AmqpConnector`]: opens connections (used again on reconnect)
//! - [`AmqpConnection`]: a long-lived connection that hands out channels
//! - [`AmqpChannel`]: the operations the pipeline performs on a channel
//!
//! The lapin-backed implementations live here as well; the publisher, the
//! topology initializer and the consumer only see the traits. Channels are
//! opened in publisher-confirm mode, so a publish only succeeds once the
//! broker acknowledged the message.

use crate::{
    config::RabbitMQConfig,
    consumer::InFlightDelivery,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
        QueueBindOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Reply code sent to the broker on a normal close
pub const AMQP_REPLY_SUCCESS: u16 = 200;

/// Deliveries of a consumer. Ends when the channel or the connection is lost.
pub type DeliveryStream = BoxStream<'static, Result<Arc<dyn InFlightDelivery>, AmqpError>>;

/// Opens new connections to the broker.
#[async_trait]
pub trait AmqpConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// A connection able to open channels.
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Whether the connection is still usable.
    fn is_open(&self) -> bool;

    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Channel operations used by the topology initializer, the publisher and
/// the consumer.
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition<'_>) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Limits the unacknowledged deliveries of this channel.
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Subscribes to `queue` with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Creates a new AMQP connection for communication with RabbitMQ.
///
/// The connection is named after `cfg.connection_name` so it can be
/// identified in the management UI.
pub async fn new_amqp_connection(cfg: &RabbitMQConfig) -> Result<Connection, AmqpError> {
    debug!(host = %cfg.host, port = cfg.port, vhost = %cfg.vhost, "creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.connection_name.clone()));

    match Connection::connect(&cfg.amqp_uri(), options).await {
        Ok(conn) => {
            debug!("amqp connected");
            Ok(conn)
        }
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }
}

/// Connector backed by lapin.
pub struct LapinConnector {
    cfg: RabbitMQConfig,
}

impl LapinConnector {
    pub fn new(cfg: RabbitMQConfig) -> Arc<LapinConnector> {
        Arc::new(LapinConnector { cfg })
    }
}

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        let conn = new_amqp_connection(&self.cfg).await?;
        Ok(Arc::new(LapinConnection { inner: conn }))
    }
}

/// Connection backed by lapin.
pub struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        let channel = self.inner.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError
        })?;

        channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                AmqpError::ChannelError
            })?;

        debug!("channel created");
        Ok(Arc::new(LapinChannel { inner: channel }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(AMQP_REPLY_SUCCESS, "connection closed")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close connection");
                AmqpError::ConnectionError
            })
    }
}

/// Channel backed by lapin.
pub struct LapinChannel {
    inner: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition<'_>) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .inner
            .exchange_declare(def.name, def.kind.into(), def.options(), def.arguments())
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.to_owned()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .inner
            .queue_declare(&def.name, def.options(), def.arguments())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .inner
            .queue_bind(
                binding.queue_name,
                binding.exchange_name,
                binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.to_owned(),
                    binding.queue_name.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .inner
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
                AmqpError::PublishingError
            })?;

        match confirm.await {
            Ok(confirmation) if confirmation.is_nack() => {
                error!(exchange, routing_key, "broker refused the message");
                Err(AmqpError::PublishingError)
            }
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error waiting publisher confirmation");
                Err(AmqpError::PublishingError)
            }
        }
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(prefetch_count.to_string())
            })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .inner
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
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError
            })?;

        Ok(consumer
            .map(|item| match item {
                Ok(delivery) => Ok(Arc::new(delivery) as Arc<dyn InFlightDelivery>),
                Err(err) => Err(AmqpError::DeliveryError(err.to_string())),
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(AMQP_REPLY_SUCCESS, "channel closed")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close channel");
                AmqpError::ChannelError
            })
    }
}
