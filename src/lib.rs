// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Reliable publication and consumption of task lifecycle events over
//! RabbitMQ, with a best-effort HTTP notification towards a listener.

mod otel;

pub mod channel;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod listener;
pub mod logging;
pub mod notifier;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod service;
pub mod shutdown;
pub mod topology;

#[cfg(test)]
pub(crate) mod test_utils;
