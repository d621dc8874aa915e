//! Delivery transports and the default channel registry.
//!
//! Every transport implements [`herald_outbox::Transport`]. Which transport
//! serves which channel is decided once, at startup, by [`default_registry`].

pub mod log;
pub mod webhook;

use std::sync::Arc;

use herald_common::config::AppConfig;
use herald_common::error::AppError;
use herald_common::types::Channel;
use herald_outbox::TransportRegistry;

pub use log::LogTransport;
pub use webhook::WebhookTransport;

/// Build the registry a worker starts with.
///
/// `email`, `sms` and `push` get a [`LogTransport`]. When `WEBHOOK_PUSH_URL`
/// is configured, `push` is delivered over HTTP instead.
pub fn default_registry(config: &AppConfig) -> Result<TransportRegistry, AppError> {
    let mut registry = TransportRegistry::new();
    for channel in [Channel::email(), Channel::sms(), Channel::push()] {
        registry.register(channel.clone(), Arc::new(LogTransport::new(channel)));
    }

    if let Some(url) = &config.webhook_push_url {
        let webhook = WebhookTransport::new(url.clone(), config.outbox.send_timeout())?;
        registry.register(Channel::push(), Arc::new(webhook));
    }

    Ok(registry)
}
