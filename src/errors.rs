// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Task Event Pipeline
//!
//! This module provides the error types used across the crate. `AmqpError`
//! represents every failure that can occur while talking to RabbitMQ
//! (connection, channel, topology declaration, publishing, acknowledging),
//! while the smaller enums cover event validation, configuration loading,
//! HTTP notification and the task service boundary.

use thiserror::Error;
use uuid::Uuid;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant provides specific context about what operation failed. The
/// enum is comparable so callers and tests can match on exact failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// The topology has no routing key to bind the main queue with
    #[error("at least one routing key must be configured")]
    MissingRoutingKeys,

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Publish was called with an empty routing key
    #[error("routing key must not be empty")]
    InvalidRoutingKey,

    /// The event handed to the publisher did not pass validation
    #[error("invalid event `{0}`")]
    InvalidEvent(String),

    /// Error serializing an event payload
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos with prefetch `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error")]
    ConsumerDeclarationError,

    /// Error reported by the delivery stream of a consumer
    #[error("failure receiving delivery: {0}")]
    DeliveryError(String),

    /// The consumer lost its subscription and could not restore it
    #[error("consumer subscription lost")]
    SubscriptionLost,
}

/// Errors raised while building or decoding task events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("event id is required")]
    MissingEventId,

    #[error("task id is required")]
    MissingTaskId,

    #[error("task title is required")]
    EmptyTitle,

    #[error("task title must not exceed {max} characters, got {actual}")]
    TitleTooLong { max: usize, actual: usize },

    #[error("task description must not exceed {max} characters, got {actual}")]
    DescriptionTooLong { max: usize, actual: usize },

    #[error("event timestamp is required")]
    MissingTimestamp,

    #[error("unknown task status `{0}`")]
    UnknownStatus(i64),

    #[error("failure to decode `{kind}` payload: {details}")]
    Decode { kind: String, details: String },
}

/// Configuration error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },

    #[error("At least one routing key must be configured in '{0}'")]
    MissingRoutingKeys(String),
}

/// Errors raised while notifying the HTTP listener.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("listener request failed: {0}")]
    HttpRequestFailed(#[from] reqwest::Error),

    #[error("listener responded with status {0}")]
    UnexpectedStatus(u16),

    #[error("http client creation failed: {0}")]
    ClientCreationFailed(String),
}

/// Failure reported by an event handler while processing a delivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("event handler failed: {0}")]
pub struct HandlerError(pub String);

/// Errors surfaced by the task service to its callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("task `{0}` was not found")]
    NotFound(Uuid),

    #[error("invalid task: {0}")]
    InvalidTask(#[from] EventError),

    #[error("repository failure: {0}")]
    Repository(String),
}
