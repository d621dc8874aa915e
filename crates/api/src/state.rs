//! Shared application state for the Axum API server.

use herald_outbox::Outbox;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub outbox: Outbox,
}

impl AppState {
    pub fn new(outbox: Outbox) -> Self {
        Self { outbox }
    }
}
