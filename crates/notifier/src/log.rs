//! Transport that records deliveries in the log instead of contacting a provider.

use async_trait::async_trait;

use herald_common::types::{Channel, NotificationEvent};
use herald_outbox::{Transport, TransportError};

/// Stand-in sender for a channel. Always succeeds.
#[derive(Debug, Clone)]
pub struct LogTransport {
    channel: Channel,
    name: String,
}

impl LogTransport {
    pub fn new(channel: Channel) -> Self {
        let name = format!("log:{}", channel);
        Self { channel, name }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

#[async_trait]
impl Transport for LogTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, event: &NotificationEvent) -> Result<(), TransportError> {
        tracing::info!(
            event_id = %event.id,
            channel = %self.channel,
            recipient = %event.payload.recipient,
            priority = %event.priority,
            attempt = event.attempts + 1,
            "Delivered notification"
        );
        Ok(())
    }
}
