// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module runs the receive loop of the task event consumer. Deliveries
//! from the main queue are dispatched to [`consume`], each on its own task,
//! so that deliveries of the same channel are processed concurrently and
//! independently. The number of unacknowledged deliveries in flight is
//! bounded by the channel prefetch count.
//!
//! The delivery stream ends when the broker connection is lost. The consumer
//! then closes the dead subscription and subscribes again under its
//! reconnect [`RetryPolicy`]. When every attempt fails the loss is reported
//! through [`TaskEventConsumer::lost`].
//!
//! Shutdown cancels the receive loop, waits a bounded grace period for
//! in-flight deliveries, then closes the channel and the connection.

use crate::{
    channel::{AmqpChannel, AmqpConnection, AmqpConnector, DeliveryStream},
    config::RabbitMQConfig,
    consumer::{consume, ConsumerSettings, EventHandler},
    errors::AmqpError,
    retry::{retry_with_backoff, RetryPolicy},
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::sync::Arc;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

/// Connection and channel a consumer is subscribed on.
struct Subscription {
    connection: Arc<dyn AmqpConnection>,
    channel: Arc<dyn AmqpChannel>,
}

impl Subscription {
    /// Connects, applies the prefetch limit and subscribes to the queue.
    async fn open(
        connector: &dyn AmqpConnector,
        settings: &ConsumerSettings,
        consumer_tag: &str,
    ) -> Result<(Subscription, DeliveryStream), AmqpError> {
        let connection = connector.connect().await?;

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    debug!(error = %close_err, "failure to close consumer connection");
                }
                return Err(err);
            }
        };

        let subscription = Subscription {
            connection,
            channel,
        };

        match subscription.subscribe(settings, consumer_tag).await {
            Ok(deliveries) => Ok((subscription, deliveries)),
            Err(err) => {
                subscription.close().await;
                Err(err)
            }
        }
    }

    async fn subscribe(
        &self,
        settings: &ConsumerSettings,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        self.channel.qos(settings.prefetch_count).await?;
        self.channel.consume(&settings.queue, consumer_tag).await
    }

    /// Closes the channel, then the connection. Failures are logged only.
    async fn close(&self) {
        if let Err(err) = self.channel.close().await {
            warn!(error = %err, "failure to close consumer channel");
        }

        if let Err(err) = self.connection.close().await {
            warn!(error = %err, "failure to close consumer connection");
        }
    }
}

/// Everything the background supervisor needs to keep a subscription alive.
#[derive(Clone)]
struct Supervisor {
    connector: Arc<dyn AmqpConnector>,
    consumer_tag: String,
    handler: Arc<dyn EventHandler>,
    settings: Arc<ConsumerSettings>,
    reconnect: RetryPolicy,
    cancellation: CancellationToken,
    lost: CancellationToken,
    tracker: TaskTracker,
}

impl Supervisor {
    /// Runs receive loops until cancelled, resubscribing whenever the
    /// delivery stream ends. Returns the live subscription on cancellation.
    async fn run(
        self,
        mut subscription: Subscription,
        mut deliveries: DeliveryStream,
    ) -> Option<Subscription> {
        loop {
            let receive_loop = spawn_receive_loop(
                deliveries,
                subscription.channel.clone(),
                self.handler.clone(),
                self.settings.clone(),
                self.cancellation.clone(),
                self.tracker.clone(),
            );

            if let Err(err) = receive_loop.await {
                error!(error = err.to_string(), "receive loop ended abnormally");
            }

            if self.cancellation.is_cancelled() {
                return Some(subscription);
            }

            warn!(queue = %self.settings.queue, "delivery stream ended, resubscribing");
            subscription.close().await;

            let resubscribed = tokio::select! {
                _ = self.cancellation.cancelled() => return None,
                result = retry_with_backoff(&self.reconnect, "resubscribe consumer", || {
                    Subscription::open(self.connector.as_ref(), &self.settings, &self.consumer_tag)
                }) => result,
            };

            match resubscribed {
                Ok((next, stream)) => {
                    info!(queue = %self.settings.queue, "consumer resubscribed");
                    subscription = next;
                    deliveries = stream;
                }
                Err(err) => {
                    error!(error = %err, queue = %self.settings.queue, "consumer subscription lost");
                    self.lost.cancel();
                    return None;
                }
            }
        }
    }
}

/// Consumer of the task events queue.
pub struct TaskEventConsumer {
    supervisor: Supervisor,
    running: Mutex<Option<JoinHandle<Option<Subscription>>>>,
}

impl TaskEventConsumer {
    pub fn new(
        connector: Arc<dyn AmqpConnector>,
        cfg: &RabbitMQConfig,
        handler: Arc<dyn EventHandler>,
    ) -> TaskEventConsumer {
        TaskEventConsumer {
            supervisor: Supervisor {
                connector,
                consumer_tag: format!("{}-consumer", cfg.connection_name),
                handler,
                settings: Arc::new(ConsumerSettings::from_config(cfg)),
                reconnect: RetryPolicy::reconnect(),
                cancellation: CancellationToken::new(),
                lost: CancellationToken::new(),
                tracker: TaskTracker::new(),
            },
            running: Mutex::new(None),
        }
    }

    pub fn with_settings(mut self, settings: ConsumerSettings) -> Self {
        self.supervisor.settings = Arc::new(settings);
        self
    }

    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.supervisor.reconnect = policy;
        self
    }

    /// Subscribes to the queue with manual acknowledgement and starts
    /// consuming in the background.
    pub async fn start(&self) -> Result<(), AmqpError> {
        let mut running = self.running.lock().await;
        let settings = &self.supervisor.settings;

        let (subscription, deliveries) = Subscription::open(
            self.supervisor.connector.as_ref(),
            settings,
            &self.supervisor.consumer_tag,
        )
        .await?;

        info!(
            queue = %settings.queue,
            prefetch = settings.prefetch_count,
            "consuming task events"
        );

        *running = Some(tokio::spawn(
            self.supervisor.clone().run(subscription, deliveries),
        ));

        Ok(())
    }

    /// Resolves once the consumer gave up restoring its subscription.
    pub async fn lost(&self) {
        self.supervisor.lost.cancelled().await
    }

    /// Stops consuming. Close failures are logged and swallowed.
    pub async fn stop(&self) {
        self.supervisor.cancellation.cancel();

        let subscription = match self.running.lock().await.take() {
            Some(handle) => handle.await.unwrap_or_else(|err| {
                error!(error = err.to_string(), "consumer supervisor ended abnormally");
                None
            }),
            None => None,
        };

        drain(&self.supervisor.tracker, &self.supervisor.settings).await;

        if let Some(subscription) = subscription {
            subscription.close().await;
        }

        info!("consumer stopped");
    }
}

/// Waits for in-flight deliveries, at most `settings.shutdown_grace`.
async fn drain(tracker: &TaskTracker, settings: &ConsumerSettings) {
    tracker.close();

    if tokio::time::timeout(settings.shutdown_grace, tracker.wait())
        .await
        .is_err()
    {
        warn!(
            in_flight = tracker.len(),
            "in-flight deliveries did not finish within the grace period"
        );
    }
}

/// Dispatches every delivery of `deliveries` to its own task on `tracker`
/// until the stream ends or `cancellation` fires.
pub(crate) fn spawn_receive_loop(
    mut deliveries: DeliveryStream,
    channel: Arc<dyn AmqpChannel>,
    handler: Arc<dyn EventHandler>,
    settings: Arc<ConsumerSettings>,
    cancellation: CancellationToken,
    tracker: TaskTracker,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = cancellation.cancelled() => {
                    debug!("receive loop cancelled");
                    break;
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let channel = channel.clone();
                    let handler = handler.clone();
                    let settings = settings.clone();

                    tracker.spawn(async move {
                        let tracer = global::tracer("amqp consumer");
                        match consume(
                            &tracer,
                            delivery.as_ref(),
                            channel.as_ref(),
                            handler.as_ref(),
                            &settings,
                        )
                        .await
                        {
                            Ok(outcome) => debug!(?outcome, "delivery settled"),
                            Err(err) => error!(error = %err, "error consume msg"),
                        }
                    });
                }
                Some(Err(err)) => error!(error = %err, "errors consume msg"),
                None => {
                    debug!("delivery stream ended");
                    break;
                }
            }
        }
    })
}
