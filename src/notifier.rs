// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Notification
//!
//! Best-effort delivery of a task event after a successful mutation. Each
//! notification does two independent things:
//!
//! 1. publishes the event to the broker under its routing key
//! 2. POSTs the same JSON to `{listener}/api/v1/events/{created|updated|deleted}`
//!
//! Failures of either side are logged and never propagated to the caller,
//! and neither side is compensated when the other one fails.

use crate::{
    config::NotifierConfig,
    errors::NotifyError,
    events::{EventKind, TaskEvent},
    publisher::EventPublisher,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Path prefix of the listener event endpoints
pub const LISTENER_EVENTS_PATH: &str = "/api/v1/events";

/// What a notification managed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationReport {
    pub published: bool,
    pub delivered: bool,
}

/// Publishes task events and forwards them to the listener service.
pub struct EventNotifier {
    publisher: Arc<dyn EventPublisher>,
    http: reqwest::Client,
    listener_base_url: String,
}

impl EventNotifier {
    pub fn new(
        publisher: Arc<dyn EventPublisher>,
        cfg: &NotifierConfig,
    ) -> Result<Arc<EventNotifier>, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|err| NotifyError::ClientCreationFailed(err.to_string()))?;

        Ok(Arc::new(EventNotifier {
            publisher,
            http,
            listener_base_url: cfg.listener_base_url.trim_end_matches('/').to_owned(),
        }))
    }

    /// Listener endpoint for events of `kind`.
    pub fn listener_url(&self, kind: EventKind) -> String {
        format!(
            "{}{}/{}",
            self.listener_base_url,
            LISTENER_EVENTS_PATH,
            kind.listener_path()
        )
    }

    /// Publishes and forwards `event`, concurrently and independently.
    pub async fn notify(&self, event: &TaskEvent) -> NotificationReport {
        let (published, delivered) = tokio::join!(
            self.publisher.publish(event, event.routing_key()),
            self.post_to_listener(event)
        );

        let published = match published {
            Ok(()) => true,
            Err(err) => {
                error!(
                    error = %err,
                    event = %event.kind(),
                    event_id = %event.event_id(),
                    "failure to publish event"
                );
                false
            }
        };

        let delivered = match delivered {
            Ok(()) => true,
            Err(err) => {
                error!(
                    error = %err,
                    event = %event.kind(),
                    event_id = %event.event_id(),
                    "failure to notify listener"
                );
                false
            }
        };

        if published && delivered {
            info!(event = %event.kind(), event_id = %event.event_id(), "event notified");
        }

        NotificationReport {
            published,
            delivered,
        }
    }

    /// Fire-and-forget variant of [`EventNotifier::notify`].
    ///
    /// The returned handle may be dropped; the task keeps running.
    pub fn notify_in_background(
        self: &Arc<Self>,
        event: TaskEvent,
    ) -> JoinHandle<NotificationReport> {
        let notifier = self.clone();
        tokio::spawn(async move { notifier.notify(&event).await })
    }

    async fn post_to_listener(&self, event: &TaskEvent) -> Result<(), NotifyError> {
        let url = self.listener_url(event.kind());
        debug!(url, event_id = %event.event_id(), "notifying listener");

        let response = self.http.post(&url).json(event).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::UnexpectedStatus(status.as_u16()));
        }

        Ok(())
    }
}
