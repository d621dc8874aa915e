use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Delivery channel identifier.
///
/// Kept as an open string rather than a closed enum so that a new channel
/// only needs a transport registered under its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Channel(String);

impl Channel {
    pub const EMAIL: &'static str = "email";
    pub const SMS: &'static str = "sms";
    pub const PUSH: &'static str = "push";

    /// Build a channel identifier, normalized to lowercase.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_ascii_lowercase())
    }

    pub fn email() -> Self {
        Self::new(Self::EMAIL)
    }

    pub fn sms() -> Self {
        Self::new(Self::SMS)
    }

    pub fn push() -> Self {
        Self::new(Self::PUSH)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Channel {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Channel {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<Channel> for String {
    fn from(value: Channel) -> Self {
        value.0
    }
}

/// Delivery priority. Ordered so that `High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// Numeric rank used for `ORDER BY priority DESC` in SQL stores.
    pub fn rank(self) -> i16 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
        }
    }

    pub fn from_rank(rank: i16) -> Result<Self, AppError> {
        match rank {
            0 => Ok(Priority::Low),
            1 => Ok(Priority::Medium),
            2 => Ok(Priority::High),
            other => Err(AppError::Store(format!("Unknown priority rank {}", other))),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(AppError::Validation(format!(
                "Invalid priority '{}'. Valid priorities: high, medium, low",
                other
            ))),
        }
    }
}

/// Lifecycle status of a notification event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Claimed,
    Sent,
    FailedRetryable,
    Dead,
}

impl EventStatus {
    /// SENT and DEAD rows are kept for audit and never claimed again.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventStatus::Sent | EventStatus::Dead)
    }

    /// Statuses a poller may claim once `next_eligible_at` has passed.
    pub fn is_claimable(self) -> bool {
        matches!(self, EventStatus::Pending | EventStatus::FailedRetryable)
    }

    /// Whether `self -> next` is one of the permitted lifecycle edges.
    ///
    /// A retry is claimed in two steps, `FailedRetryable -> Pending -> Claimed`.
    /// Reviving a dead event is an operator action and not a lifecycle edge.
    pub fn can_transition_to(self, next: EventStatus) -> bool {
        use EventStatus::*;
        matches!(
            (self, next),
            (Pending, Claimed)
                | (Claimed, Sent)
                | (Claimed, FailedRetryable)
                | (Claimed, Dead)
                | (FailedRetryable, Pending)
                | (FailedRetryable, Dead)
        )
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventStatus::Pending => write!(f, "pending"),
            EventStatus::Claimed => write!(f, "claimed"),
            EventStatus::Sent => write!(f, "sent"),
            EventStatus::FailedRetryable => write!(f, "failed_retryable"),
            EventStatus::Dead => write!(f, "dead"),
        }
    }
}

impl std::str::FromStr for EventStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(EventStatus::Pending),
            "claimed" => Ok(EventStatus::Claimed),
            "sent" => Ok(EventStatus::Sent),
            "failed_retryable" => Ok(EventStatus::FailedRetryable),
            "dead" => Ok(EventStatus::Dead),
            other => Err(AppError::Validation(format!("Invalid status '{}'", other))),
        }
    }
}

/// Opaque content plus the recipient it is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub recipient: String,
    pub content: String,
}

/// The unit of work persisted in the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Caller-supplied id, also the idempotency key.
    pub id: String,
    pub channel: Channel,
    pub priority: Priority,
    pub payload: NotificationPayload,
    pub status: EventStatus,
    /// Number of resolved dispatch attempts.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Not claimable before this instant. While CLAIMED this is the lease expiry.
    pub next_eligible_at: DateTime<Utc>,
    pub claim_token: Option<Uuid>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl NotificationEvent {
    /// A fresh PENDING event built from an enqueue request.
    pub fn pending(request: NewNotification, now: DateTime<Utc>) -> Self {
        Self {
            id: request.id,
            channel: request.channel,
            priority: request.priority,
            payload: NotificationPayload {
                recipient: request.recipient,
                content: request.content,
            },
            status: EventStatus::Pending,
            attempts: 0,
            created_at: now,
            next_eligible_at: now,
            claim_token: None,
            last_attempted_at: None,
            last_error: None,
        }
    }
}

/// Enqueue request submitted by producers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNotification {
    pub id: String,
    pub channel: Channel,
    pub priority: Priority,
    pub recipient: String,
    pub content: String,
}

impl NewNotification {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.id.trim().is_empty() {
            return Err(AppError::Validation("id must not be empty".to_string()));
        }
        if self.channel.is_empty() {
            return Err(AppError::Validation("channel must not be empty".to_string()));
        }
        if self.recipient.trim().is_empty() {
            return Err(AppError::Validation(
                "recipient must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of one dispatch attempt, written back through `resolve`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    FailedRetryable {
        next_eligible_at: DateTime<Utc>,
        reason: String,
    },
    Dead {
        reason: String,
    },
}

impl Outcome {
    /// Status the event lands in once this outcome is applied.
    pub fn status(&self) -> EventStatus {
        match self {
            Outcome::Sent => EventStatus::Sent,
            Outcome::FailedRetryable { .. } => EventStatus::FailedRetryable,
            Outcome::Dead { .. } => EventStatus::Dead,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Sent => None,
            Outcome::FailedRetryable { reason, .. } | Outcome::Dead { reason } => Some(reason),
        }
    }
}
