//! Channel → transport registry.
//!
//! Any type implementing [`Transport`] can be registered for a channel. The
//! dispatcher only sees the capability, never concrete sender types.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use herald_common::types::{Channel, NotificationEvent};

/// Why a single `send` did not succeed. Every variant is retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The channel backend refused or failed the delivery.
    #[error("delivery rejected: {0}")]
    Rejected(String),

    /// The send did not finish within the configured timeout.
    #[error("send timed out after {0}ms")]
    Timeout(u64),

    /// The transport panicked while sending.
    #[error("transport panicked")]
    Panicked,

    /// Nothing is registered for the event's channel.
    #[error("no transport registered for channel '{0}'")]
    NoTransport(Channel),
}

impl TransportError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }
}

/// Delivery capability for one channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable name used in logs (e.g., "smtp", "webhook").
    fn name(&self) -> &str;

    /// Deliver one event. Channel-side deduplication, if any, is the
    /// transport's concern: the engine may call this more than once per event.
    async fn send(&self, event: &NotificationEvent) -> Result<(), TransportError>;
}

/// Registry of transports keyed by channel, built explicitly at startup.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<Channel, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `transport` for `channel`, replacing any previous entry.
    pub fn register(&mut self, channel: Channel, transport: Arc<dyn Transport>) -> &mut Self {
        if let Some(previous) = self.transports.insert(channel.clone(), transport) {
            tracing::info!(
                channel = %channel,
                replaced = previous.name(),
                "Replaced transport registration"
            );
        }
        self
    }

    /// Builder-style variant of [`register`](Self::register).
    pub fn with(mut self, channel: Channel, transport: Arc<dyn Transport>) -> Self {
        self.register(channel, transport);
        self
    }

    pub fn get(&self, channel: &Channel) -> Option<Arc<dyn Transport>> {
        self.transports.get(channel).cloned()
    }

    pub fn contains(&self, channel: &Channel) -> bool {
        self.transports.contains_key(channel)
    }

    /// Registered channels, sorted for stable log output.
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.transports.keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("channels", &self.channels())
            .finish()
    }
}
