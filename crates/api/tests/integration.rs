//! Integration tests for API routes.
//!
//! Uses `tower::ServiceExt` to test Axum routes without a real HTTP server,
//! backed by the in-memory event store.
//!
//! ```bash
//! cargo test -p herald-api --test integration
//! ```

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use tower::ServiceExt;

use herald_api::routes::create_router;
use herald_api::state::AppState;
use herald_common::types::{EventStatus, Outcome};
use herald_outbox::{EventStore, MemoryEventStore, Outbox};

// ============================================================
// Helpers
// ============================================================

fn build_app() -> (Router, Arc<MemoryEventStore>) {
    let store = Arc::new(MemoryEventStore::default());
    let state = AppState::new(Outbox::new(store.clone()));
    (create_router(state), store)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn notification(id: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "channel": "email",
        "priority": "high",
        "recipient": "alice@example.com",
        "content": "Your invoice is ready"
    })
}

/// Claim and dead-letter `id` directly through the store.
async fn dead_letter(store: &MemoryEventStore, id: &str) {
    let claimed = store.claim_batch(10, Utc::now()).await.unwrap();
    let event = claimed.into_iter().find(|e| e.id == id).unwrap();
    let outcome = Outcome::Dead {
        reason: "mailbox full".to_string(),
    };
    assert!(store
        .resolve(id, event.claim_token.unwrap(), outcome)
        .await
        .unwrap());
}

// ============================================================
// Health
// ============================================================

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _) = build_app();
    let (status, json) = send(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "herald-api");
    assert_eq!(json["store"], "ok");
}

// ============================================================
// Enqueue
// ============================================================

#[tokio::test]
async fn test_enqueue_is_idempotent() {
    let (app, store) = build_app();

    let (status, json) = send(&app, post_json("/api/notifications", notification("inv-1"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["created"], true);

    let mut replay = notification("inv-1");
    replay["content"] = serde_json::json!("different body");
    let (status, json) = send(&app, post_json("/api/notifications", replay)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["created"], false);

    assert_eq!(store.len().await, 1);
    let stored = store.get("inv-1").await.unwrap().unwrap();
    assert_eq!(stored.payload.content, "Your invoice is ready");
}

#[tokio::test]
async fn test_enqueue_rejects_blank_fields() {
    let (app, store) = build_app();

    let mut body = notification("inv-2");
    body["recipient"] = serde_json::json!("");
    let (status, json) = send(&app, post_json("/api/notifications", body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("recipient"));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_enqueue_rejects_unknown_priority() {
    let (app, _) = build_app();

    let mut body = notification("inv-3");
    body["priority"] = serde_json::json!("urgent");
    let (status, _) = send(&app, post_json("/api/notifications", body)).await;

    assert!(status.is_client_error());
}

// ============================================================
// Inspection
// ============================================================

#[tokio::test]
async fn test_get_notification() {
    let (app, _) = build_app();
    send(&app, post_json("/api/notifications", notification("inv-4"))).await;

    let (status, json) = send(&app, get("/api/notifications/inv-4")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], "inv-4");
    assert_eq!(json["status"], "pending");
    assert_eq!(json["attempts"], 0);

    let (status, json) = send(&app, get("/api/notifications/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn test_list_by_status() {
    let (app, store) = build_app();
    send(&app, post_json("/api/notifications", notification("a"))).await;
    send(&app, post_json("/api/notifications", notification("b"))).await;
    dead_letter(&store, "a").await;

    let (status, json) = send(&app, get("/api/notifications")).await;
    assert_eq!(status, StatusCode::OK);
    let dead = json.as_array().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0]["id"], "a");
    assert_eq!(dead[0]["last_error"], "mailbox full");

    // "b" was claimed by the dead-letter helper and never resolved.
    let (_, json) = send(&app, get("/api/notifications?status=claimed&limit=10")).await;
    assert_eq!(json.as_array().unwrap().len(), 1);

    let (status, _) = send(&app, get("/api/notifications?limit=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================================================
// Revive
// ============================================================

#[tokio::test]
async fn test_revive_dead_notification() {
    let (app, store) = build_app();
    send(&app, post_json("/api/notifications", notification("r-1"))).await;

    let (status, json) = send(&app, post_empty("/api/notifications/r-1/revive")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["revived"], false);

    dead_letter(&store, "r-1").await;
    let (status, json) = send(&app, post_empty("/api/notifications/r-1/revive")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["revived"], true);

    let stored = store.get("r-1").await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Pending);
    assert_eq!(stored.attempts, 0);

    let (status, _) = send(&app, post_empty("/api/notifications/ghost/revive")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
