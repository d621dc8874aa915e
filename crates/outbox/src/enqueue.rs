//! Producer-facing entry point plus the operator surface over stored events.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use herald_common::error::AppError;
use herald_common::types::{EventStatus, NewNotification, NotificationEvent};

use crate::store::EventStore;

/// Whether an enqueue created a new event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnqueueResult {
    pub created: bool,
}

/// Idempotent ingestion API shared by HTTP handlers and in-process producers.
#[derive(Clone)]
pub struct Outbox {
    store: Arc<dyn EventStore>,
}

impl Outbox {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn EventStore> {
        self.store.clone()
    }

    /// Persist a new PENDING event unless one with the same id already exists.
    ///
    /// A duplicate id is a silent no-op: the stored event, whatever its state,
    /// is left untouched and `created` is `false`.
    pub async fn enqueue(&self, request: NewNotification) -> Result<EnqueueResult, AppError> {
        request.validate()?;

        let id = request.id.clone();
        let channel = request.channel.clone();
        let priority = request.priority;
        let created = self
            .store
            .insert_if_absent(NotificationEvent::pending(request, Utc::now()))
            .await?;

        if created {
            tracing::info!(event_id = %id, channel = %channel, priority = %priority, "Notification enqueued");
        } else {
            tracing::debug!(event_id = %id, "Duplicate enqueue ignored");
        }

        Ok(EnqueueResult { created })
    }

    pub async fn get(&self, id: &str) -> Result<NotificationEvent, AppError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))
    }

    pub async fn list_by_status(
        &self,
        status: EventStatus,
        limit: usize,
    ) -> Result<Vec<NotificationEvent>, AppError> {
        self.store.list_by_status(status, limit).await
    }

    /// Return a dead-lettered event to the queue with a fresh attempt budget.
    pub async fn revive(&self, id: &str) -> Result<bool, AppError> {
        let revived = self.store.revive(id, Utc::now()).await?;
        if revived {
            tracing::info!(event_id = %id, "Dead-lettered notification revived");
        }
        Ok(revived)
    }
}

#[cfg(test)]
mod tests {
    use herald_common::types::{Channel, Priority};

    use super::*;
    use crate::memory::MemoryEventStore;

    fn request(id: &str, content: &str) -> NewNotification {
        NewNotification {
            id: id.to_string(),
            channel: Channel::email(),
            priority: Priority::Medium,
            recipient: "user@example.com".to_string(),
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_twice_keeps_first_payload() {
        let outbox = Outbox::new(Arc::new(MemoryEventStore::default()));

        let first = outbox.enqueue(request("order-42", "shipped")).await.unwrap();
        let second = outbox.enqueue(request("order-42", "cancelled")).await.unwrap();
        assert!(first.created);
        assert!(!second.created);

        let stored = outbox.get("order-42").await.unwrap();
        assert_eq!(stored.payload.content, "shipped");
        assert_eq!(stored.status, EventStatus::Pending);
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_request() {
        let outbox = Outbox::new(Arc::new(MemoryEventStore::default()));
        let result = outbox.enqueue(request("", "hi")).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let outbox = Outbox::new(Arc::new(MemoryEventStore::default()));
        assert!(matches!(outbox.get("nope").await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_revive_requires_dead_event() {
        let outbox = Outbox::new(Arc::new(MemoryEventStore::default()));
        outbox.enqueue(request("a", "hi")).await.unwrap();
        assert!(!outbox.revive("a").await.unwrap());
        assert!(!outbox.revive("missing").await.unwrap());
    }
}
