// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module provides the per-delivery processing logic of the task event
//! consumer: decoding by routing key, invoking the [`EventHandler`], and the
//! bounded retry mechanism that republishes failed messages with an
//! incremented `x-retry-count` header before dead-lettering them.
//!
//! A delivery ends in one of these states:
//! - acked after successful handling
//! - acked and dropped when the routing key is unknown
//! - republished with `x-retry-count + 1` and the original acked
//! - rejected without requeue, which the broker routes to the DLQ

use crate::{
    channel::AmqpChannel,
    config::RabbitMQConfig,
    errors::{AmqpError, HandlerError},
    events::{EventKind, TaskEvent, TaskSnapshot},
    otel,
};
use async_trait::async_trait;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
    types::{AMQPValue, LongInt, ShortString},
    BasicProperties,
};
#[cfg(test)]
use mockall::automock;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{borrow::Cow, time::Duration};
use tracing::{debug, error, info, warn};

/// Header carrying how many times a message has already been retried
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";
/// Retries granted to a failing message before it is dead-lettered
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// A message received from the broker that still has to be settled.
///
/// Implemented for lapin's [`Delivery`]; settling is always manual.
#[async_trait]
pub trait InFlightDelivery: Send + Sync {
    fn routing_key(&self) -> &str;

    fn data(&self) -> &[u8];

    fn properties(&self) -> &BasicProperties;

    /// Positive acknowledgement, removes the message from the queue.
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Negative acknowledgement without requeue.
    async fn reject(&self) -> Result<(), AmqpError>;
}

#[async_trait]
impl InFlightDelivery for Delivery {
    fn routing_key(&self) -> &str {
        self.routing_key.as_str()
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn reject(&self) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue: false,
            })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

/// Side effect executed for every decoded event.
///
/// Implementations must be idempotent: delivery is at-least-once and a
/// retried message is handled again from scratch.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &TaskEvent) -> Result<(), HandlerError>;
}

/// Default handler, logs the event fields per kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle(&self, event: &TaskEvent) -> Result<(), HandlerError> {
        match event {
            TaskEvent::Created(e) => log_snapshot(event.kind(), e),
            TaskEvent::Updated(e) => log_snapshot(event.kind(), e),
            TaskEvent::Deleted(e) => info!(
                event = %event.kind(),
                event_id = %e.event_id(),
                task_id = %e.task_id(),
                "task event processed"
            ),
        }

        Ok(())
    }
}

fn log_snapshot(kind: EventKind, snapshot: &TaskSnapshot) {
    info!(
        event = %kind,
        event_id = %snapshot.event_id(),
        task_id = %snapshot.task_id(),
        title = snapshot.title(),
        status = %snapshot.status(),
        "task event processed"
    );
}

/// Settings of the consuming side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    /// Exchange failed messages are republished to.
    pub exchange: String,
    pub queue: String,
    pub max_retries: u32,
    pub prefetch_count: u16,
    /// Upper bound on the wait for in-flight deliveries at shutdown.
    pub shutdown_grace: Duration,
}

impl ConsumerSettings {
    pub fn from_config(cfg: &RabbitMQConfig) -> ConsumerSettings {
        ConsumerSettings {
            exchange: cfg.exchange.clone(),
            queue: cfg.queue.clone(),
            prefetch_count: cfg.prefetch_count,
            ..ConsumerSettings::default()
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        let cfg = RabbitMQConfig::default();
        ConsumerSettings {
            exchange: cfg.exchange,
            queue: cfg.queue,
            max_retries: DEFAULT_MAX_RETRIES,
            prefetch_count: cfg.prefetch_count,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    /// Unknown routing key, acked without processing.
    Dropped,
    /// Republished for another attempt carrying this retry count.
    Requeued { retry_count: u32 },
    DeadLettered,
}

/// Consumes and processes a single delivery.
///
/// Decode and handler failures both count as processing failures. While the
/// retry count is below `settings.max_retries` the message is republished to
/// the main exchange under its original routing key with the counter
/// incremented and the original is acked; otherwise, or when the republish
/// fails, the delivery is rejected without requeue so the broker dead-letters
/// it.
pub async fn consume(
    tracer: &BoxedTracer,
    delivery: &dyn InFlightDelivery,
    channel: &dyn AmqpChannel,
    handler: &dyn EventHandler,
    settings: &ConsumerSettings,
) -> Result<DeliveryOutcome, AmqpError> {
    let routing_key = delivery.routing_key();
    let retry_count = extract_retry_count(delivery.properties());

    let (_, mut span) = otel::new_span(delivery.properties(), tracer, routing_key);

    debug!(routing_key, retry_count, queue = %settings.queue, "received");

    let Some(kind) = EventKind::from_routing_key(routing_key) else {
        let msg = "removing message from queue - reason: unknown routing key";
        warn!(routing_key, "{}", msg);
        span.set_status(Status::Error {
            description: Cow::from(msg),
        });

        delivery.ack().await?;
        return Ok(DeliveryOutcome::Dropped);
    };

    let processed = match TaskEvent::decode(kind, delivery.data()) {
        Ok(event) => handler.handle(&event).await.map_err(|err| err.to_string()),
        Err(err) => Err(err.to_string()),
    };

    match processed {
        Ok(()) => {
            debug!(routing_key, "message successfully processed");
            match delivery.ack().await {
                Ok(()) => {
                    span.set_status(Status::Ok);
                    Ok(DeliveryOutcome::Acked)
                }
                Err(err) => {
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    Err(err)
                }
            }
        }
        Err(reason) => {
            span.set_status(Status::Error {
                description: Cow::from(reason.clone()),
            });
            warn!(routing_key, retry_count, reason = %reason, "failure processing message");

            retry_or_dead_letter(delivery, channel, settings, retry_count).await
        }
    }
}

async fn retry_or_dead_letter(
    delivery: &dyn InFlightDelivery,
    channel: &dyn AmqpChannel,
    settings: &ConsumerSettings,
    retry_count: u32,
) -> Result<DeliveryOutcome, AmqpError> {
    let routing_key = delivery.routing_key();

    if retry_count >= settings.max_retries {
        error!(routing_key, retry_count, "too many attempts, sending to dlq");
        delivery.reject().await?;
        return Ok(DeliveryOutcome::DeadLettered);
    }

    let next = retry_count + 1;
    let properties = with_retry_count(delivery.properties(), next);

    match channel
        .publish(&settings.exchange, routing_key, delivery.data(), properties)
        .await
    {
        Ok(()) => {
            warn!(routing_key, retry_count = next, "requeuing message for later");
            delivery.ack().await?;
            Ok(DeliveryOutcome::Requeued { retry_count: next })
        }
        Err(err) => {
            error!(error = %err, routing_key, "error whiling requeuing, sending to dlq");
            delivery.reject().await?;
            Ok(DeliveryOutcome::DeadLettered)
        }
    }
}

/// Reads `x-retry-count`, accepting any integer encoding. Missing, negative
/// or non-integer values count as zero.
pub(crate) fn extract_retry_count(props: &BasicProperties) -> u32 {
    let Some(headers) = props.headers() else {
        return 0;
    };

    let count = match headers.inner().get(AMQP_HEADERS_RETRY_COUNT) {
        Some(AMQPValue::ShortShortInt(v)) => i64::from(*v),
        Some(AMQPValue::ShortShortUInt(v)) => i64::from(*v),
        Some(AMQPValue::ShortInt(v)) => i64::from(*v),
        Some(AMQPValue::ShortUInt(v)) => i64::from(*v),
        Some(AMQPValue::LongInt(v)) => i64::from(*v),
        Some(AMQPValue::LongUInt(v)) => i64::from(*v),
        Some(AMQPValue::LongLongInt(v)) => *v,
        _ => 0,
    };

    u32::try_from(count.max(0)).unwrap_or(u32::MAX)
}

fn with_retry_count(props: &BasicProperties, count: u32) -> BasicProperties {
    let mut headers = props.headers().clone().unwrap_or_default();
    headers.insert(
        ShortString::from(AMQP_HEADERS_RETRY_COUNT),
        AMQPValue::LongInt(LongInt::try_from(count).unwrap_or(LongInt::MAX)),
    );

    props.clone().with_headers(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::{TaskCreated, TaskStatus},
        test_utils::{FakeBroker, FakeDelivery, Settlement},
    };
    use lapin::types::{FieldTable, ShortString};
    use opentelemetry::global;
    use std::sync::Arc;
    use uuid::Uuid;

    fn buy_milk_payload() -> Vec<u8> {
        let event = TaskCreated::new(Uuid::new_v4(), "Buy milk", None, TaskStatus::New).unwrap();
        serde_json::to_vec(&event).unwrap()
    }

    fn properties() -> BasicProperties {
        BasicProperties::default()
            .with_message_id(ShortString::from("msg-1"))
            .with_delivery_mode(2)
    }

    async fn open_channel(broker: &FakeBroker) -> Arc<dyn AmqpChannel> {
        broker
            .connector()
            .connect()
            .await
            .unwrap()
            .open_channel()
            .await
            .unwrap()
    }

    fn failing_handler() -> MockEventHandler {
        let mut handler = MockEventHandler::new();
        handler
            .expect_handle()
            .returning(|_| Err(HandlerError("storage unavailable".to_owned())));
        handler
    }

    #[tokio::test]
    async fn test_valid_event_is_handled_and_acked() {
        let broker = FakeBroker::new();
        let channel = open_channel(&broker).await;
        let delivery = FakeDelivery::new("task.created", buy_milk_payload(), properties());

        let outcome = consume(
            &global::tracer("test"),
            &delivery,
            channel.as_ref(),
            &LoggingEventHandler,
            &ConsumerSettings::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Acked);
        assert_eq!(delivery.settlements(), vec![Settlement::Acked]);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_always_failing_message_is_retried_twice_then_dead_lettered() {
        let broker = FakeBroker::new();
        let channel = open_channel(&broker).await;
        let handler = failing_handler();
        let settings = ConsumerSettings::default();
        let tracer = global::tracer("test");

        let first = FakeDelivery::new("task.created", buy_milk_payload(), properties());
        let outcome = consume(&tracer, &first, channel.as_ref(), &handler, &settings)
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Requeued { retry_count: 1 });
        assert_eq!(first.settlements(), vec![Settlement::Acked]);

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, "task_events");
        assert_eq!(published[0].routing_key, "task.created");
        assert_eq!(extract_retry_count(&published[0].properties), 1);

        let second = FakeDelivery::from_published(&published[0]);
        let outcome = consume(&tracer, &second, channel.as_ref(), &handler, &settings)
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Requeued { retry_count: 2 });
        assert_eq!(second.settlements(), vec![Settlement::Acked]);

        let published = broker.published();
        assert_eq!(published.len(), 2);
        assert_eq!(extract_retry_count(&published[1].properties), 2);

        let third = FakeDelivery::from_published(&published[1]);
        let outcome = consume(&tracer, &third, channel.as_ref(), &handler, &settings)
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::DeadLettered);
        assert_eq!(third.settlements(), vec![Settlement::Rejected]);
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn test_republish_keeps_body_and_properties() {
        let broker = FakeBroker::new();
        let channel = open_channel(&broker).await;
        let payload = buy_milk_payload();
        let delivery = FakeDelivery::new("task.created", payload.clone(), properties());

        consume(
            &global::tracer("test"),
            &delivery,
            channel.as_ref(),
            &failing_handler(),
            &ConsumerSettings::default(),
        )
        .await
        .unwrap();

        let published = broker.published();
        assert_eq!(published[0].payload, payload);
        assert_eq!(
            published[0].properties.message_id(),
            &Some(ShortString::from("msg-1"))
        );
        assert_eq!(published[0].properties.delivery_mode(), &Some(2));
    }

    #[tokio::test]
    async fn test_unknown_routing_key_is_dropped() {
        let broker = FakeBroker::new();
        let channel = open_channel(&broker).await;
        let mut handler = MockEventHandler::new();
        handler.expect_handle().times(0);
        let delivery = FakeDelivery::new("task.archived", buy_milk_payload(), properties());

        let outcome = consume(
            &global::tracer("test"),
            &delivery,
            channel.as_ref(),
            &handler,
            &ConsumerSettings::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Dropped);
        assert_eq!(delivery.settlements(), vec![Settlement::Acked]);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_body_counts_as_processing_failure() {
        let broker = FakeBroker::new();
        let channel = open_channel(&broker).await;
        let mut handler = MockEventHandler::new();
        handler.expect_handle().times(0);
        let delivery = FakeDelivery::new("task.updated", b"{not json".to_vec(), properties());

        let outcome = consume(
            &global::tracer("test"),
            &delivery,
            channel.as_ref(),
            &handler,
            &ConsumerSettings::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Requeued { retry_count: 1 });
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_republish_dead_letters() {
        let broker = FakeBroker::new();
        let channel = open_channel(&broker).await;
        broker.fail_next_publishes(1);
        let delivery = FakeDelivery::new("task.created", buy_milk_payload(), properties());

        let outcome = consume(
            &global::tracer("test"),
            &delivery,
            channel.as_ref(),
            &failing_handler(),
            &ConsumerSettings::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, DeliveryOutcome::DeadLettered);
        assert_eq!(delivery.settlements(), vec![Settlement::Rejected]);
        assert!(broker.published().is_empty());
    }

    #[test]
    fn test_extract_retry_count_accepts_any_integer() {
        let with = |value: AMQPValue| {
            let mut headers = FieldTable::default();
            headers.insert(ShortString::from(AMQP_HEADERS_RETRY_COUNT), value);
            extract_retry_count(&BasicProperties::default().with_headers(headers))
        };

        assert_eq!(extract_retry_count(&BasicProperties::default()), 0);
        assert_eq!(with(AMQPValue::LongInt(2)), 2);
        assert_eq!(with(AMQPValue::LongLongInt(1)), 1);
        assert_eq!(with(AMQPValue::ShortShortUInt(3)), 3);
        assert_eq!(with(AMQPValue::LongInt(-4)), 0);
        assert_eq!(with(AMQPValue::Boolean(true)), 0);
    }

    #[test]
    fn test_settings_from_config() {
        let cfg = RabbitMQConfig {
            exchange: "events".to_owned(),
            queue: "events_queue".to_owned(),
            prefetch_count: 4,
            ..RabbitMQConfig::default()
        };

        let settings = ConsumerSettings::from_config(&cfg);
        assert_eq!(settings.exchange, "events");
        assert_eq!(settings.queue, "events_queue");
        assert_eq!(settings.prefetch_count, 4);
        assert_eq!(settings.max_retries, DEFAULT_MAX_RETRIES);
    }
}
