// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Listener HTTP Service
//!
//! Receiving side of the HTTP notification. Exposes one endpoint per event
//! kind under `/api/v1/events`; bodies are decoded and validated exactly
//! like broker deliveries and handed to an [`EventHandler`].
//!
//! | Route                          | Body          |
//! |--------------------------------|---------------|
//! | `POST /api/v1/events/created`  | `TaskCreated` |
//! | `POST /api/v1/events/updated`  | `TaskUpdated` |
//! | `POST /api/v1/events/deleted`  | `TaskDeleted` |

use crate::{
    consumer::EventHandler,
    events::{EventKind, TaskEvent},
    notifier::LISTENER_EVENTS_PATH,
};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Clone)]
struct ListenerState {
    handler: Arc<dyn EventHandler>,
}

/// Router with the three event endpoints.
pub fn router(handler: Arc<dyn EventHandler>) -> Router {
    Router::new()
        .route(&route(EventKind::Created), post(created))
        .route(&route(EventKind::Updated), post(updated))
        .route(&route(EventKind::Deleted), post(deleted))
        .with_state(ListenerState { handler })
}

fn route(kind: EventKind) -> String {
    format!("{}/{}", LISTENER_EVENTS_PATH, kind.listener_path())
}

async fn created(State(state): State<ListenerState>, body: Bytes) -> Response {
    receive(&state, EventKind::Created, &body).await
}

async fn updated(State(state): State<ListenerState>, body: Bytes) -> Response {
    receive(&state, EventKind::Updated, &body).await
}

async fn deleted(State(state): State<ListenerState>, body: Bytes) -> Response {
    receive(&state, EventKind::Deleted, &body).await
}

async fn receive(state: &ListenerState, kind: EventKind, body: &[u8]) -> Response {
    let event = match TaskEvent::decode(kind, body) {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, event = %kind, "rejecting event");
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: err.to_string(),
                }),
            )
                .into_response();
        }
    };

    match state.handler.handle(&event).await {
        Ok(()) => (
            StatusCode::OK,
            Json(MessageResponse {
                message: format!("{} processed", kind.event_name()),
            }),
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, event = %kind, event_id = %event.event_id(), "failure handling event");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: err.to_string(),
                }),
            )
                .into_response()
        }
    }
}
