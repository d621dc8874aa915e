//! PostgreSQL-backed [`EventStore`].
//!
//! Claims use `FOR UPDATE SKIP LOCKED` inside a single `UPDATE ... RETURNING`
//! statement, so concurrent pollers on separate connections (or separate
//! processes) partition the ready rows between them instead of blocking or
//! double-claiming. Resolution is a conditional update on the claim token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    Channel, EventStatus, NotificationEvent, NotificationPayload, Outcome, Priority,
};

use crate::store::{EventStore, LEASE_EXPIRED_REASON, LeaseSettings};

/// Raw `notification_events` row.
#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: String,
    seq: i64,
    channel: String,
    priority: i16,
    recipient: String,
    content: String,
    status: String,
    attempts: i32,
    created_at: DateTime<Utc>,
    next_eligible_at: DateTime<Utc>,
    claim_token: Option<Uuid>,
    last_attempted_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl TryFrom<EventRow> for NotificationEvent {
    type Error = AppError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(NotificationEvent {
            id: row.id,
            channel: Channel::new(row.channel),
            priority: Priority::from_rank(row.priority)?,
            payload: NotificationPayload {
                recipient: row.recipient,
                content: row.content,
            },
            status: row
                .status
                .parse()
                .map_err(|_| AppError::Store(format!("Unknown status '{}'", row.status)))?,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            created_at: row.created_at,
            next_eligible_at: row.next_eligible_at,
            claim_token: row.claim_token,
            last_attempted_at: row.last_attempted_at,
            last_error: row.last_error,
        })
    }
}

fn into_events(rows: Vec<EventRow>) -> Result<Vec<NotificationEvent>, AppError> {
    rows.into_iter().map(NotificationEvent::try_from).collect()
}

pub struct PgEventStore {
    pool: PgPool,
    lease: LeaseSettings,
}

impl PgEventStore {
    pub fn new(pool: PgPool, lease: LeaseSettings) -> Self {
        Self { pool, lease }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn insert_if_absent(&self, event: NotificationEvent) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO notification_events
                (id, channel, priority, recipient, content, status, attempts, created_at, next_eligible_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&event.id)
        .bind(event.channel.as_str())
        .bind(event.priority.rank())
        .bind(&event.payload.recipient)
        .bind(&event.payload.content)
        .bind(event.status.to_string())
        .bind(i32::try_from(event.attempts).unwrap_or(i32::MAX))
        .bind(event.created_at)
        .bind(event.next_eligible_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn claim_batch(
        &self,
        max_count: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<NotificationEvent>, AppError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            WITH picked AS (
                SELECT id FROM notification_events
                WHERE status IN ('pending', 'failed_retryable')
                  AND next_eligible_at <= $1
                ORDER BY priority DESC, created_at ASC, seq ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE notification_events e
            SET status = 'claimed',
                claim_token = gen_random_uuid(),
                next_eligible_at = $3
            FROM picked
            WHERE e.id = picked.id
            RETURNING e.*
            "#,
        )
        .bind(now)
        .bind(i64::try_from(max_count).unwrap_or(i64::MAX))
        .bind(self.lease.lease_expiry(now))
        .fetch_all(&self.pool)
        .await?;

        // RETURNING does not preserve the CTE's order.
        let mut rows = rows;
        rows.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.seq.cmp(&b.seq))
        });

        into_events(rows)
    }

    async fn resolve(
        &self,
        id: &str,
        claim_token: Uuid,
        outcome: Outcome,
    ) -> Result<bool, AppError> {
        let next_eligible_at = match &outcome {
            Outcome::FailedRetryable {
                next_eligible_at, ..
            } => Some(*next_eligible_at),
            _ => None,
        };

        let result = sqlx::query(
            r#"
            UPDATE notification_events
            SET status = $3,
                attempts = attempts + 1,
                last_attempted_at = NOW(),
                claim_token = NULL,
                next_eligible_at = COALESCE($4, next_eligible_at),
                last_error = COALESCE($5, last_error)
            WHERE id = $1 AND status = 'claimed' AND claim_token = $2
            "#,
        )
        .bind(id)
        .bind(claim_token)
        .bind(outcome.status().to_string())
        .bind(next_eligible_at)
        .bind(outcome.reason())
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() == 1;
        if !applied {
            tracing::debug!(event_id = %id, "Ignoring stale resolve for reclaimed event");
        }
        Ok(applied)
    }

    async fn requeue_expired_claims(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notification_events
            SET attempts = attempts + 1,
                claim_token = NULL,
                last_error = $2,
                next_eligible_at = $1,
                status = CASE
                    WHEN attempts + 1 >= $3 THEN 'dead'
                    ELSE 'failed_retryable'
                END
            WHERE status = 'claimed' AND next_eligible_at < $1
            "#,
        )
        .bind(now)
        .bind(LEASE_EXPIRED_REASON)
        .bind(i32::try_from(self.lease.max_attempts).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get(&self, id: &str) -> Result<Option<NotificationEvent>, AppError> {
        let row: Option<EventRow> =
            sqlx::query_as("SELECT * FROM notification_events WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(NotificationEvent::try_from).transpose()
    }

    async fn list_by_status(
        &self,
        status: EventStatus,
        limit: usize,
    ) -> Result<Vec<NotificationEvent>, AppError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT * FROM notification_events
            WHERE status = $1
            ORDER BY created_at ASC, seq ASC
            LIMIT $2
            "#,
        )
        .bind(status.to_string())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        into_events(rows)
    }

    async fn revive(&self, id: &str, now: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notification_events
            SET status = 'pending',
                attempts = 0,
                claim_token = NULL,
                next_eligible_at = $2
            WHERE id = $1 AND status = 'dead'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
