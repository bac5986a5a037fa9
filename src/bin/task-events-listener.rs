// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Task Events Listener - Entry Point
//!
//! HTTP service receiving task event notifications.

use eyre::{Result, WrapErr};
use std::sync::Arc;
use task_events::{
    config::{Environment, FromEnv, ListenerConfig},
    consumer::LoggingEventHandler,
    listener::router,
    logging::init_tracing,
    shutdown::shutdown_signal,
};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let environment = Environment::from_env();
    init_tracing(&environment);

    let cfg = ListenerConfig::from_env().wrap_err("Failed to load listener configuration")?;
    let address = cfg.address();

    let listener = TcpListener::bind(&address)
        .await
        .wrap_err_with(|| format!("Failed to bind listener to {}", address))?;
    info!(address = %address, "Task events listener started");

    axum::serve(listener, router(Arc::new(LoggingEventHandler)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("Listener server failed")?;

    Ok(())
}
