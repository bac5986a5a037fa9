// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Task Lifecycle Events
//!
//! Immutable event records published whenever a task is created, updated or
//! deleted. Each record carries a freshly generated event id and the UTC
//! instant it was built at. The JSON encoding uses PascalCase field names and
//! the integer code of the task status, which is the wire format shared with
//! the consumer and the HTTP listener.

use crate::errors::EventError;
use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, ops::Deref};
use uuid::Uuid;

/// Routing key for task creation events
pub const TASK_CREATED_ROUTING_KEY: &str = "task.created";
/// Routing key for task update events
pub const TASK_UPDATED_ROUTING_KEY: &str = "task.updated";
/// Routing key for task deletion events
pub const TASK_DELETED_ROUTING_KEY: &str = "task.deleted";
/// Routing key used between the dead letter exchange and the dead letter queue
pub const DLQ_ROUTING_KEY: &str = "dlq.task";

pub const TITLE_MAX_LEN: usize = 200;
pub const DESCRIPTION_MAX_LEN: usize = 2000;

/// Lifecycle status of a task, encoded on the wire by its integer code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[default]
    New = 0,
    InProgress = 1,
    Completed = 2,
}

impl TaskStatus {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<i64> for TaskStatus {
    type Error = EventError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TaskStatus::New),
            1 => Ok(TaskStatus::InProgress),
            2 => Ok(TaskStatus::Completed),
            other => Err(EventError::UnknownStatus(other)),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::New => write!(f, "New"),
            TaskStatus::InProgress => write!(f, "InProgress"),
            TaskStatus::Completed => write!(f, "Completed"),
        }
    }
}

impl Serialize for TaskStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i64::deserialize(deserializer)?;
        TaskStatus::try_from(code).map_err(de::Error::custom)
    }
}

/// The three kinds of task events, one per routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    pub fn routing_key(self) -> &'static str {
        match self {
            EventKind::Created => TASK_CREATED_ROUTING_KEY,
            EventKind::Updated => TASK_UPDATED_ROUTING_KEY,
            EventKind::Deleted => TASK_DELETED_ROUTING_KEY,
        }
    }

    /// Maps a routing key back to its event kind. Unknown keys yield `None`.
    pub fn from_routing_key(key: &str) -> Option<EventKind> {
        match key {
            TASK_CREATED_ROUTING_KEY => Some(EventKind::Created),
            TASK_UPDATED_ROUTING_KEY => Some(EventKind::Updated),
            TASK_DELETED_ROUTING_KEY => Some(EventKind::Deleted),
            _ => None,
        }
    }

    /// Last path segment of the listener endpoint for this kind.
    pub fn listener_path(self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
        }
    }

    pub fn event_name(self) -> &'static str {
        match self {
            EventKind::Created => "TaskCreatedEvent",
            EventKind::Updated => "TaskUpdatedEvent",
            EventKind::Deleted => "TaskDeletedEvent",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

/// Full state of a task at the moment it was created or updated.
///
/// Fields are private: a snapshot can only be built through the validating
/// constructors of [`TaskCreated`] and [`TaskUpdated`] or decoded from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskSnapshot {
    event_id: Uuid,
    task_id: Uuid,
    title: String,
    #[serde(default)]
    description: Option<String>,
    status: TaskStatus,
    timestamp: DateTime<Utc>,
}

impl TaskSnapshot {
    fn build(
        task_id: Uuid,
        title: String,
        description: Option<String>,
        status: TaskStatus,
    ) -> Result<Self, EventError> {
        let snapshot = TaskSnapshot {
            event_id: Uuid::new_v4(),
            task_id,
            title,
            description,
            status,
            timestamp: Utc::now(),
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn validate(&self) -> Result<(), EventError> {
        validate_header(self.event_id, self.task_id, self.timestamp)?;

        if self.title.trim().is_empty() {
            return Err(EventError::EmptyTitle);
        }

        let title_len = self.title.chars().count();
        if title_len > TITLE_MAX_LEN {
            return Err(EventError::TitleTooLong {
                max: TITLE_MAX_LEN,
                actual: title_len,
            });
        }

        if let Some(description) = &self.description {
            let description_len = description.chars().count();
            if description_len > DESCRIPTION_MAX_LEN {
                return Err(EventError::DescriptionTooLong {
                    max: DESCRIPTION_MAX_LEN,
                    actual: description_len,
                });
            }
        }

        Ok(())
    }
}

fn validate_header(event_id: Uuid, task_id: Uuid, timestamp: DateTime<Utc>) -> Result<(), EventError> {
    if event_id.is_nil() {
        return Err(EventError::MissingEventId);
    }
    if task_id.is_nil() {
        return Err(EventError::MissingTaskId);
    }
    if timestamp <= DateTime::<Utc>::UNIX_EPOCH {
        return Err(EventError::MissingTimestamp);
    }
    Ok(())
}

/// Emitted after a task has been persisted for the first time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskCreated(TaskSnapshot);

impl TaskCreated {
    pub fn new(
        task_id: Uuid,
        title: impl Into<String>,
        description: Option<String>,
        status: TaskStatus,
    ) -> Result<Self, EventError> {
        TaskSnapshot::build(task_id, title.into(), description, status).map(TaskCreated)
    }
}

impl Deref for TaskCreated {
    type Target = TaskSnapshot;

    fn deref(&self) -> &TaskSnapshot {
        &self.0
    }
}

/// Emitted after an existing task has been modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskUpdated(TaskSnapshot);

impl TaskUpdated {
    pub fn new(
        task_id: Uuid,
        title: impl Into<String>,
        description: Option<String>,
        status: TaskStatus,
    ) -> Result<Self, EventError> {
        TaskSnapshot::build(task_id, title.into(), description, status).map(TaskUpdated)
    }
}

impl Deref for TaskUpdated {
    type Target = TaskSnapshot;

    fn deref(&self) -> &TaskSnapshot {
        &self.0
    }
}

/// Emitted after a task has been removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskDeleted {
    event_id: Uuid,
    task_id: Uuid,
    timestamp: DateTime<Utc>,
}

impl TaskDeleted {
    pub fn new(task_id: Uuid) -> Result<Self, EventError> {
        let event = TaskDeleted {
            event_id: Uuid::new_v4(),
            task_id,
            timestamp: Utc::now(),
        };
        event.validate()?;
        Ok(event)
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn validate(&self) -> Result<(), EventError> {
        validate_header(self.event_id, self.task_id, self.timestamp)
    }
}

/// Closed set of task events. Serializes as the bare inner record; the kind
/// travels out of band as the routing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TaskEvent {
    Created(TaskCreated),
    Updated(TaskUpdated),
    Deleted(TaskDeleted),
}

impl TaskEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TaskEvent::Created(_) => EventKind::Created,
            TaskEvent::Updated(_) => EventKind::Updated,
            TaskEvent::Deleted(_) => EventKind::Deleted,
        }
    }

    pub fn routing_key(&self) -> &'static str {
        self.kind().routing_key()
    }

    pub fn event_id(&self) -> Uuid {
        match self {
            TaskEvent::Created(e) => e.event_id(),
            TaskEvent::Updated(e) => e.event_id(),
            TaskEvent::Deleted(e) => e.event_id(),
        }
    }

    pub fn task_id(&self) -> Uuid {
        match self {
            TaskEvent::Created(e) => e.task_id(),
            TaskEvent::Updated(e) => e.task_id(),
            TaskEvent::Deleted(e) => e.task_id(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TaskEvent::Created(e) => e.timestamp(),
            TaskEvent::Updated(e) => e.timestamp(),
            TaskEvent::Deleted(e) => e.timestamp(),
        }
    }

    pub fn validate(&self) -> Result<(), EventError> {
        match self {
            TaskEvent::Created(e) => e.validate(),
            TaskEvent::Updated(e) => e.validate(),
            TaskEvent::Deleted(e) => e.validate(),
        }
    }

    /// Decodes a JSON payload as the given kind and validates the result.
    pub fn decode(kind: EventKind, data: &[u8]) -> Result<TaskEvent, EventError> {
        let decoded = match kind {
            EventKind::Created => serde_json::from_slice(data).map(TaskEvent::Created),
            EventKind::Updated => serde_json::from_slice(data).map(TaskEvent::Updated),
            EventKind::Deleted => serde_json::from_slice(data).map(TaskEvent::Deleted),
        };

        let event = decoded.map_err(|err| EventError::Decode {
            kind: kind.event_name().to_owned(),
            details: err.to_string(),
        })?;

        event.validate()?;
        Ok(event)
    }
}

impl From<TaskCreated> for TaskEvent {
    fn from(event: TaskCreated) -> Self {
        TaskEvent::Created(event)
    }
}

impl From<TaskUpdated> for TaskEvent {
    fn from(event: TaskUpdated) -> Self {
        TaskEvent::Updated(event)
    }
}

impl From<TaskDeleted> for TaskEvent {
    fn from(event: TaskDeleted) -> Self {
        TaskEvent::Deleted(event)
    }
}
