// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Logging
//!
//! Installs the global `tracing` subscriber used by the binaries.
//!
//! - **Production** (`APP_ENV=production`): flattened JSON lines, no targets.
//! - **Development** (default): pretty human-readable output.
//!
//! `RUST_LOG` overrides the default filter in both modes.

use crate::config::Environment;
use tracing::{debug, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Initializes tracing. Safe to call more than once; later calls are no-ops.
pub fn init_tracing(environment: &Environment) {
    let is_production = environment.is_production();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if is_production {
            EnvFilter::new("info,lapin=warn")
        } else {
            EnvFilter::new("debug,lapin=info,hyper=info")
        }
    });

    let result = if is_production {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .flatten_event(true),
            )
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false)
                    .pretty(),
            )
            .with(filter)
            .try_init()
    };

    match result {
        Ok(_) => info!(environment = ?environment, "tracing initialized"),
        Err(_) => debug!("tracing already initialized, skipping re-initialization"),
    }
}
