// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Task Events Consumer - Entry Point
//!
//! Declares the broker topology, then consumes the task events queue until
//! Ctrl+C or SIGTERM. Exits with an error when the consumer loses its broker
//! subscription and cannot restore it.

use eyre::{Result, WrapErr};
use std::sync::Arc;
use task_events::{
    channel::LapinConnector,
    config::{Environment, FromEnv, RabbitMQConfig},
    consumer::LoggingEventHandler,
    dispatcher::TaskEventConsumer,
    errors::AmqpError,
    logging::init_tracing,
    retry::RetryPolicy,
    shutdown::shutdown_signal,
    topology::TopologyInitializer,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let environment = Environment::from_env();
    init_tracing(&environment);

    let cfg = RabbitMQConfig::from_env().wrap_err("Failed to load RabbitMQ configuration")?;
    info!(
        host = %cfg.host,
        port = cfg.port,
        vhost = %cfg.vhost,
        exchange = %cfg.exchange,
        queue = %cfg.queue,
        "Starting task events consumer"
    );

    TopologyInitializer::new(LapinConnector::new(cfg.clone()), cfg.clone())
        .initialize_with_startup_retry(&RetryPolicy::startup())
        .await
        .wrap_err("Failed to initialize RabbitMQ topology")?;

    let consumer = TaskEventConsumer::new(
        LapinConnector::new(cfg.clone()),
        &cfg,
        Arc::new(LoggingEventHandler),
    );
    consumer
        .start()
        .await
        .wrap_err("Failed to start consuming task events")?;

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = consumer.lost() => {
            error!("Task events consumer lost its RabbitMQ subscription");
            consumer.stop().await;
            return Err::<(), _>(AmqpError::SubscriptionLost)
                .wrap_err("Task events consumer stopped consuming");
        }
    }

    consumer.stop().await;

    info!("Task events consumer shut down");
    Ok(())
}
