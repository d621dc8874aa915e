//! HTTP surface for producers and operators.
//!
//! Endpoints:
//! - POST /api/notifications — enqueue (idempotent on `id`)
//! - GET  /api/notifications/{id} — inspect one event
//! - GET  /api/notifications?status=dead — list events by status
//! - POST /api/notifications/{id}/revive — requeue a dead-lettered event
//! - GET  /health

pub mod routes;
pub mod state;
