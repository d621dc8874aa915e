//! In-memory reference implementation of [`EventStore`].
//!
//! Rows live in an append-only arena; `index` maps ids to arena slots and
//! `ready` keeps claimable slots sorted by `(priority desc, created_at, slot)`.
//! Since the arena never shrinks, the slot number doubles as the insertion
//! sequence that makes FIFO strict when two events share a timestamp.
//! `leased` orders claimed slots by lease expiry so the sweep only visits
//! live claims, never the SENT and DEAD rows kept for audit.
//!
//! The mutex is held for exactly one operation and never across an await on
//! anything other than itself, which makes each operation atomic with respect
//! to every other caller sharing the store.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{EventStatus, NotificationEvent, Outcome, Priority};

use crate::store::{EventStore, LEASE_EXPIRED_REASON, LeaseSettings};

type ReadyKey = (Reverse<Priority>, DateTime<Utc>, usize);
type LeaseKey = (DateTime<Utc>, usize);

#[derive(Default)]
struct Inner {
    arena: Vec<NotificationEvent>,
    index: HashMap<String, usize>,
    ready: BTreeSet<ReadyKey>,
    leased: BTreeSet<LeaseKey>,
}

impl Inner {
    fn mark_ready(&mut self, slot: usize) {
        let event = &self.arena[slot];
        self.ready.insert((Reverse(event.priority), event.created_at, slot));
    }
}

/// Move `event` along one lifecycle edge.
fn transition(event: &mut NotificationEvent, next: EventStatus) {
    debug_assert!(
        event.status.can_transition_to(next),
        "illegal transition {} -> {} for event {}",
        event.status,
        next,
        event.id
    );
    event.status = next;
}

pub struct MemoryEventStore {
    lease: LeaseSettings,
    inner: Mutex<Inner>,
}

impl MemoryEventStore {
    pub fn new(lease: LeaseSettings) -> Self {
        Self {
            lease,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Number of stored events in any status.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.arena.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of events currently held under a claim lease.
    pub async fn leased_count(&self) -> usize {
        self.inner.lock().await.leased.len()
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new(LeaseSettings::default())
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert_if_absent(&self, event: NotificationEvent) -> Result<bool, AppError> {
        let mut inner = self.inner.lock().await;
        if inner.index.contains_key(&event.id) {
            return Ok(false);
        }

        let slot = inner.arena.len();
        let claimable = event.status.is_claimable();
        inner.index.insert(event.id.clone(), slot);
        inner.arena.push(event);
        if claimable {
            inner.mark_ready(slot);
        }
        Ok(true)
    }

    async fn claim_batch(
        &self,
        max_count: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationEvent>, AppError> {
        let mut inner = self.inner.lock().await;

        let selected: Vec<ReadyKey> = inner
            .ready
            .iter()
            .filter(|(_, _, slot)| inner.arena[*slot].next_eligible_at <= now)
            .take(max_count)
            .copied()
            .collect();

        let lease_expiry = self.lease.lease_expiry(now);
        let mut claimed = Vec::with_capacity(selected.len());
        for key in selected {
            let slot = key.2;
            inner.ready.remove(&key);
            inner.leased.insert((lease_expiry, slot));

            let event = &mut inner.arena[slot];
            if event.status == EventStatus::FailedRetryable {
                transition(event, EventStatus::Pending);
            }
            transition(event, EventStatus::Claimed);
            event.claim_token = Some(Uuid::new_v4());
            event.next_eligible_at = lease_expiry;
            claimed.push(event.clone());
        }

        Ok(claimed)
    }

    async fn resolve(
        &self,
        id: &str,
        claim_token: Uuid,
        outcome: Outcome,
    ) -> Result<bool, AppError> {
        let mut inner = self.inner.lock().await;
        let Some(&slot) = inner.index.get(id) else {
            return Ok(false);
        };

        let event = &inner.arena[slot];
        if event.status != EventStatus::Claimed || event.claim_token != Some(claim_token) {
            tracing::debug!(event_id = %id, "Ignoring stale resolve for reclaimed event");
            return Ok(false);
        }
        let lease_key = (event.next_eligible_at, slot);
        inner.leased.remove(&lease_key);

        let event = &mut inner.arena[slot];
        event.attempts = event.attempts.saturating_add(1);
        event.last_attempted_at = Some(Utc::now());
        event.claim_token = None;
        transition(event, outcome.status());
        if let Some(reason) = outcome.reason() {
            event.last_error = Some(reason.to_string());
        }
        if let Outcome::FailedRetryable {
            next_eligible_at, ..
        } = outcome
        {
            event.next_eligible_at = next_eligible_at;
            inner.mark_ready(slot);
        }

        Ok(true)
    }

    async fn requeue_expired_claims(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let mut inner = self.inner.lock().await;

        let expired: Vec<LeaseKey> = inner
            .leased
            .iter()
            .take_while(|(expiry, _)| *expiry < now)
            .copied()
            .collect();

        let max_attempts = self.lease.max_attempts;
        for key in &expired {
            let slot = key.1;
            inner.leased.remove(key);

            let event = &mut inner.arena[slot];
            event.attempts = event.attempts.saturating_add(1);
            event.claim_token = None;
            event.last_error = Some(LEASE_EXPIRED_REASON.to_string());
            event.next_eligible_at = now;
            if event.attempts >= max_attempts {
                transition(event, EventStatus::Dead);
                tracing::warn!(
                    event_id = %event.id,
                    attempts = event.attempts,
                    "Expired claim exhausted attempts, dead-lettered"
                );
            } else {
                transition(event, EventStatus::FailedRetryable);
                inner.mark_ready(slot);
            }
        }

        Ok(expired.len() as u64)
    }

    async fn get(&self, id: &str) -> Result<Option<NotificationEvent>, AppError> {
        let inner = self.inner.lock().await;
        Ok(inner.index.get(id).map(|&slot| inner.arena[slot].clone()))
    }

    async fn list_by_status(
        &self,
        status: EventStatus,
        limit: usize,
    ) -> Result<Vec<NotificationEvent>, AppError> {
        let inner = self.inner.lock().await;
        let mut matching: Vec<(DateTime<Utc>, usize)> = inner
            .arena
            .iter()
            .enumerate()
            .filter(|(_, e)| e.status == status)
            .map(|(slot, e)| (e.created_at, slot))
            .collect();
        matching.sort();

        Ok(matching
            .into_iter()
            .take(limit)
            .map(|(_, slot)| inner.arena[slot].clone())
            .collect())
    }

    async fn revive(&self, id: &str, now: DateTime<Utc>) -> Result<bool, AppError> {
        let mut inner = self.inner.lock().await;
        let Some(&slot) = inner.index.get(id) else {
            return Ok(false);
        };

        let event = &mut inner.arena[slot];
        if event.status != EventStatus::Dead {
            return Ok(false);
        }
        // Operator override: DEAD has no outgoing lifecycle edge.
        event.status = EventStatus::Pending;
        event.attempts = 0;
        event.claim_token = None;
        event.next_eligible_at = now;
        inner.mark_ready(slot);

        Ok(true)
    }
}
