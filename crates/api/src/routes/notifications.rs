//! Notification enqueue and inspection routes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use herald_common::error::AppError;
use herald_common::types::{EventStatus, NewNotification, NotificationEvent};
use herald_outbox::EnqueueResult;

use crate::state::AppState;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", post(enqueue_notification))
        .route("/api/notifications", get(list_notifications))
        .route("/api/notifications/{id}", get(get_notification))
        .route("/api/notifications/{id}/revive", post(revive_notification))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default = "default_status")]
    pub status: EventStatus,
    pub limit: Option<usize>,
}

fn default_status() -> EventStatus {
    EventStatus::Dead
}

/// POST /api/notifications — Enqueue a notification.
///
/// Replaying an id already in the outbox is a no-op answered with `200`.
async fn enqueue_notification(
    State(state): State<AppState>,
    Json(request): Json<NewNotification>,
) -> Result<(StatusCode, Json<EnqueueResult>), AppError> {
    let result = state.outbox.enqueue(request).await?;
    let status = if result.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(result)))
}

/// GET /api/notifications — List events in one status (dead-lettered by default).
async fn list_notifications(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<NotificationEvent>>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if limit == 0 || limit > MAX_LIST_LIMIT {
        return Err(AppError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_LIST_LIMIT
        )));
    }

    let events = state.outbox.list_by_status(params.status, limit).await?;
    Ok(Json(events))
}

/// GET /api/notifications/:id — Fetch one event with its delivery state.
async fn get_notification(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<NotificationEvent>, AppError> {
    let event = state.outbox.get(&id).await?;
    Ok(Json(event))
}

/// POST /api/notifications/:id/revive — Requeue a dead-lettered event.
async fn revive_notification(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    // 404 for unknown ids; `revived: false` for events that are not dead.
    state.outbox.get(&id).await?;
    let revived = state.outbox.revive(&id).await?;
    Ok(Json(serde_json::json!({ "revived": revived })))
}
