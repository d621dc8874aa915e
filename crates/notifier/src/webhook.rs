//! HTTP webhook transport.
//!
//! Each attempt is a single `POST` of the event as JSON. The event id is sent
//! as `Idempotency-Key` so a receiver can discard the duplicates that
//! at-least-once delivery produces.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;

use herald_common::error::AppError;
use herald_common::types::{Channel, NotificationEvent, Priority};
use herald_outbox::{Transport, TransportError};

/// Body of a webhook delivery.
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    id: &'a str,
    channel: &'a Channel,
    priority: Priority,
    recipient: &'a str,
    content: &'a str,
    attempt: u32,
    created_at: DateTime<Utc>,
}

impl<'a> From<&'a NotificationEvent> for WebhookPayload<'a> {
    fn from(event: &'a NotificationEvent) -> Self {
        Self {
            id: &event.id,
            channel: &event.channel,
            priority: event.priority,
            recipient: &event.payload.recipient,
            content: &event.payload.content,
            attempt: event.attempts + 1,
            created_at: event.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookTransport {
    url: String,
    client: Client,
}

impl WebhookTransport {
    /// `timeout` bounds the whole request; keep it under the dispatcher's send timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("herald/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build webhook client: {}", e)))?;

        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebhookTransport {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), TransportError> {
        tracing::debug!(event_id = %event.id, url = %self.url, "Posting webhook");

        let response = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", event.id.as_str())
            .json(&WebhookPayload::from(event))
            .send()
            .await
            .map_err(|e| TransportError::rejected(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body = body.chars().take(200).collect::<String>();
            return Err(TransportError::rejected(format!("HTTP {}: {}", status, body)));
        }

        Ok(())
    }
}
