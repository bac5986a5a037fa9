// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Task Service
//!
//! Mutations of tasks and the point where their events are emitted. Every
//! operation validates the event it will emit, persists through the
//! [`TaskRepository`], and only then hands the event to the
//! [`EventNotifier`] in the background. A failed notification never fails
//! the mutation.

use crate::{
    errors::ServiceError,
    events::{TaskCreated, TaskDeleted, TaskStatus, TaskUpdated},
    notifier::EventNotifier,
};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
}

/// Storage of tasks.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn insert(&self, task: &Task) -> Result<(), ServiceError>;

    /// Returns `false` when no task has the given id.
    async fn update(&self, task: &Task) -> Result<bool, ServiceError>;

    /// Returns `false` when no task has the given id.
    async fn delete(&self, id: Uuid) -> Result<bool, ServiceError>;
}

pub struct TaskService {
    repository: Arc<dyn TaskRepository>,
    notifier: Arc<EventNotifier>,
}

impl TaskService {
    pub fn new(repository: Arc<dyn TaskRepository>, notifier: Arc<EventNotifier>) -> TaskService {
        TaskService {
            repository,
            notifier,
        }
    }

    pub async fn create(
        &self,
        title: &str,
        description: Option<String>,
    ) -> Result<Task, ServiceError> {
        let task = Task {
            id: Uuid::new_v4(),
            title: title.trim().to_owned(),
            description,
            status: TaskStatus::New,
        };
        let event = TaskCreated::new(
            task.id,
            task.title.clone(),
            task.description.clone(),
            task.status,
        )?;

        self.repository.insert(&task).await?;
        info!(task_id = %task.id, title = %task.title, "task created");

        self.notifier.notify_in_background(event.into());
        Ok(task)
    }

    pub async fn update(
        &self,
        id: Uuid,
        title: &str,
        description: Option<String>,
        status: TaskStatus,
    ) -> Result<Task, ServiceError> {
        let task = Task {
            id,
            title: title.trim().to_owned(),
            description,
            status,
        };
        let event = TaskUpdated::new(
            task.id,
            task.title.clone(),
            task.description.clone(),
            task.status,
        )?;

        if !self.repository.update(&task).await? {
            warn!(task_id = %id, "task not found for update");
            return Err(ServiceError::NotFound(id));
        }
        info!(task_id = %id, status = %status, "task updated");

        self.notifier.notify_in_background(event.into());
        Ok(task)
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), ServiceError> {
        let event = TaskDeleted::new(id)?;

        if !self.repository.delete(id).await? {
            warn!(task_id = %id, "task not found for deletion");
            return Err(ServiceError::NotFound(id));
        }
        info!(task_id = %id, "task deleted");

        self.notifier.notify_in_background(event.into());
        Ok(())
    }
}
