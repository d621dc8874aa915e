//! Durable store interface consumed by the engine.
//!
//! Every operation is individually atomic. The store is the only shared
//! mutable state between pollers, so the claim/resolve/sweep contract below is
//! what makes concurrent pollers safe:
//!
//! - `claim_batch` never hands the same event to two callers;
//! - `resolve` only applies when the caller still owns the claim token;
//! - `requeue_expired_claims` recovers work held by a crashed or stalled poller.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use herald_common::config::OutboxConfig;
use herald_common::error::AppError;
use herald_common::types::{EventStatus, NotificationEvent, Outcome};

/// Reason recorded on events recovered by the expired-claim sweep.
pub const LEASE_EXPIRED_REASON: &str = "claim lease expired";

/// Lease length and attempt budget a store applies when claiming and sweeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseSettings {
    pub claim_lease: Duration,
    pub max_attempts: u32,
}

impl LeaseSettings {
    pub fn from_config(config: &OutboxConfig) -> Self {
        Self {
            claim_lease: config.claim_lease(),
            max_attempts: config.max_attempts,
        }
    }

    /// Lease expiry for a claim taken at `now`.
    pub fn lease_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.claim_lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self::from_config(&OutboxConfig::default())
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert `event` unless a row with the same id exists.
    ///
    /// Returns `true` if the row was created, `false` if the id was already
    /// present (the existing row is left untouched).
    async fn insert_if_absent(&self, event: NotificationEvent) -> Result<bool, AppError>;

    /// Atomically claim up to `max_count` claimable events whose
    /// `next_eligible_at <= now`, ordered by priority (high first) then
    /// creation time. Claimed events get a fresh claim token and a lease
    /// expiry in `next_eligible_at`.
    async fn claim_batch(
        &self,
        max_count: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationEvent>, AppError>;

    /// Apply `outcome` to a claimed event, counting one attempt.
    ///
    /// Returns `false` without changing anything when the event is no longer
    /// claimed under `claim_token` (a stale write from a poller whose lease
    /// was recovered).
    async fn resolve(
        &self,
        id: &str,
        claim_token: Uuid,
        outcome: Outcome,
    ) -> Result<bool, AppError>;

    /// Turn claims whose lease expired before `now` back into retryable work,
    /// counting the lost attempt. Events that exhaust their budget this way are
    /// dead-lettered. Returns the number of recovered events.
    async fn requeue_expired_claims(&self, now: DateTime<Utc>) -> Result<u64, AppError>;

    async fn get(&self, id: &str) -> Result<Option<NotificationEvent>, AppError>;

    /// Events in `status`, oldest first.
    async fn list_by_status(
        &self,
        status: EventStatus,
        limit: usize,
    ) -> Result<Vec<NotificationEvent>, AppError>;

    /// Operator requeue of a dead-lettered event: back to PENDING with a fresh
    /// attempt budget. Returns `false` if the event is not DEAD.
    async fn revive(&self, id: &str, now: DateTime<Utc>) -> Result<bool, AppError>;
}
