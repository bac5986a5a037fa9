// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module provides the reliable publisher of task events. It keeps one
//! long-lived connection, re-establishes it on demand when the broker dropped
//! it, opens a fresh channel for every message and retries failed publishes
//! with exponential backoff. OpenTelemetry context is propagated in the
//! message headers.

use crate::{
    channel::{AmqpConnection, AmqpConnector},
    errors::AmqpError,
    events::TaskEvent,
    otel,
    retry::{retry_with_backoff, RetryPolicy},
};
use async_trait::async_trait;
use chrono::Utc;
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
#[cfg(test)]
use mockall::automock;
use opentelemetry::Context;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Delivery mode asking the broker to persist the message
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Publishes task events to the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes `event` under `routing_key`.
    ///
    /// An empty routing key or an invalid event is rejected before any I/O.
    async fn publish(&self, event: &TaskEvent, routing_key: &str) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of [`EventPublisher`].
///
/// Safe to share between tasks: the connection lock only guards reconnects
/// and every publish runs on its own channel.
pub struct RabbitMQPublisher {
    connector: Arc<dyn AmqpConnector>,
    exchange: String,
    policy: RetryPolicy,
    connection: RwLock<Option<Arc<dyn AmqpConnection>>>,
}

impl RabbitMQPublisher {
    /// Creates a publisher that connects on its first publish.
    pub fn new(connector: Arc<dyn AmqpConnector>, exchange: &str) -> Arc<RabbitMQPublisher> {
        RabbitMQPublisher::with_policy(connector, exchange, RetryPolicy::publisher())
    }

    pub fn with_policy(
        connector: Arc<dyn AmqpConnector>,
        exchange: &str,
        policy: RetryPolicy,
    ) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher {
            connector,
            exchange: exchange.to_owned(),
            policy,
            connection: RwLock::new(None),
        })
    }

    /// Creates a publisher and opens its connection right away.
    pub async fn connect(
        connector: Arc<dyn AmqpConnector>,
        exchange: &str,
    ) -> Result<Arc<RabbitMQPublisher>, AmqpError> {
        let publisher = RabbitMQPublisher::new(connector, exchange);
        publisher.ensure_connection().await?;
        Ok(publisher)
    }

    /// Closes the current connection, if any. Errors are logged only.
    pub async fn close(&self) {
        let Some(conn) = self.connection.write().await.take() else {
            return;
        };

        match conn.close().await {
            Ok(()) => debug!("publisher connection closed"),
            Err(err) => warn!(error = %err, "failure to close publisher connection"),
        }
    }

    /// Returns an open connection, reconnecting when the current one is
    /// missing or closed. Concurrent callers share a single reconnect.
    async fn ensure_connection(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        if let Some(conn) = self.connection.read().await.as_ref() {
            if conn.is_open() {
                return Ok(conn.clone());
            }
        }

        let mut guard = self.connection.write().await;

        if let Some(conn) = guard.as_ref() {
            if conn.is_open() {
                return Ok(conn.clone());
            }
        }

        if let Some(stale) = guard.take() {
            warn!("connection closed, reconnecting...");
            if let Err(err) = stale.close().await {
                debug!(error = %err, "failure to close stale connection");
            }
        }

        let conn = self.connector.connect().await?;
        *guard = Some(conn.clone());
        info!(exchange = %self.exchange, "publisher connected");

        Ok(conn)
    }

    async fn publish_once(
        &self,
        payload: &[u8],
        routing_key: &str,
        properties: &BasicProperties,
    ) -> Result<(), AmqpError> {
        let conn = self.ensure_connection().await?;
        let channel = conn.open_channel().await?;

        let result = channel
            .publish(&self.exchange, routing_key, payload, properties.clone())
            .await;

        if let Err(err) = channel.close().await {
            debug!(error = %err, "failure to close publish channel");
        }

        result
    }
}

#[async_trait]
impl EventPublisher for RabbitMQPublisher {
    async fn publish(&self, event: &TaskEvent, routing_key: &str) -> Result<(), AmqpError> {
        if routing_key.trim().is_empty() {
            error!(event_id = %event.event_id(), "refusing to publish without routing key");
            return Err(AmqpError::InvalidRoutingKey);
        }

        event.validate().map_err(|err| {
            error!(error = %err, event_id = %event.event_id(), "refusing to publish invalid event");
            AmqpError::InvalidEvent(err.to_string())
        })?;

        let payload = serde_json::to_vec(event).map_err(|err| {
            error!(error = %err, "failure to serialize event");
            AmqpError::SerializePayloadError
        })?;

        // Every attempt carries the same message and correlation ids.
        let message_id = Uuid::new_v4().to_string();
        let properties = message_properties(&message_id, &Context::current());

        retry_with_backoff(&self.policy, "publish", || {
            self.publish_once(&payload, routing_key, &properties)
        })
        .await?;

        info!(
            event = %event.kind(),
            event_id = %event.event_id(),
            task_id = %event.task_id(),
            routing_key,
            message_id,
            "event published"
        );

        Ok(())
    }
}

fn message_properties(message_id: &str, ctx: &Context) -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_message_id(ShortString::from(message_id))
        .with_correlation_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_timestamp(Utc::now().timestamp().max(0) as u64)
        .with_headers(FieldTable::from(otel::inject_context(ctx)))
}
