use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;

/// Tuning knobs for the outbox poller, dispatcher and backoff policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutboxConfig {
    /// Wait between poll cycles in milliseconds (default: 1000)
    pub poll_interval_ms: u64,

    /// Maximum events claimed per cycle (default: 10)
    pub batch_size: usize,

    /// Attempts after which an event is dead-lettered (default: 5)
    pub max_attempts: u32,

    /// Backoff delay for the first retry in milliseconds (default: 200)
    pub base_backoff_ms: u64,

    /// Upper bound on the exponential part of the backoff (default: 2000)
    pub max_backoff_ms: u64,

    /// Random extra delay added on top of the backoff (default: 100)
    pub jitter_ms: u64,

    /// How long a claim is owned before another poller may recover it (default: 10000)
    pub claim_lease_ms: u64,

    /// Per-send timeout; exceeding it counts as a failed attempt (default: 3000)
    pub send_timeout_ms: u64,

    /// Maximum concurrent sends within one batch (default: 5)
    pub worker_limit: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            batch_size: 10,
            max_attempts: 5,
            base_backoff_ms: 200,
            max_backoff_ms: 2000,
            jitter_ms: 100,
            claim_lease_ms: 10_000,
            send_timeout_ms: 3000,
            worker_limit: 5,
        }
    }
}

impl OutboxConfig {
    /// Load outbox settings from environment variables, falling back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load outbox settings through an arbitrary variable lookup.
    ///
    /// The result is validated; malformed or inconsistent values are fatal.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let config = Self {
            poll_interval_ms: parse_or(&lookup, "OUTBOX_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            batch_size: parse_or(&lookup, "OUTBOX_BATCH_SIZE", defaults.batch_size)?,
            max_attempts: parse_or(&lookup, "OUTBOX_MAX_ATTEMPTS", defaults.max_attempts)?,
            base_backoff_ms: parse_or(&lookup, "OUTBOX_BASE_BACKOFF_MS", defaults.base_backoff_ms)?,
            max_backoff_ms: parse_or(&lookup, "OUTBOX_MAX_BACKOFF_MS", defaults.max_backoff_ms)?,
            jitter_ms: parse_or(&lookup, "OUTBOX_JITTER_MS", defaults.jitter_ms)?,
            claim_lease_ms: parse_or(&lookup, "OUTBOX_CLAIM_LEASE_MS", defaults.claim_lease_ms)?,
            send_timeout_ms: parse_or(&lookup, "OUTBOX_SEND_TIMEOUT_MS", defaults.send_timeout_ms)?,
            worker_limit: parse_or(&lookup, "OUTBOX_WORKER_LIMIT", defaults.worker_limit)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        let fail = |msg: &str| Err(AppError::Config(msg.to_string()));

        if self.poll_interval_ms == 0 {
            return fail("poll_interval_ms must be greater than zero");
        }
        if self.batch_size == 0 {
            return fail("batch_size must be greater than zero");
        }
        if self.max_attempts == 0 {
            return fail("max_attempts must be at least 1");
        }
        if self.base_backoff_ms == 0 {
            return fail("base_backoff_ms must be greater than zero");
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return fail("max_backoff_ms must not be smaller than base_backoff_ms");
        }
        if self.claim_lease_ms == 0 {
            return fail("claim_lease_ms must be greater than zero");
        }
        if self.send_timeout_ms == 0 {
            return fail("send_timeout_ms must be greater than zero");
        }
        if self.send_timeout_ms >= self.claim_lease_ms {
            return fail("send_timeout_ms must be shorter than claim_lease_ms");
        }
        if self.worker_limit == 0 {
            return fail("worker_limit must be greater than zero");
        }
        // A batch is claimed at once but sent in waves of `worker_limit`; the
        // last wave must still be able to finish inside the lease.
        if self.batch_send_budget_ms() >= self.claim_lease_ms {
            return Err(AppError::Config(format!(
                "{} send waves of {}ms (batch_size {} / worker_limit {}) do not fit in claim_lease_ms {}",
                self.batch_size.div_ceil(self.worker_limit),
                self.send_timeout_ms,
                self.batch_size,
                self.worker_limit,
                self.claim_lease_ms
            )));
        }
        Ok(())
    }

    /// Worst-case time to send one full batch: every wave hits the send timeout.
    pub fn batch_send_budget_ms(&self) -> u64 {
        let waves = self.batch_size.div_ceil(self.worker_limit.max(1)) as u64;
        waves.saturating_mul(self.send_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_millis(self.claim_lease_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 10)
    pub db_max_connections: u32,

    /// Address the HTTP API listens on (default: 0.0.0.0:3000)
    pub api_bind_addr: String,

    /// Optional webhook endpoint that receives push notifications
    pub webhook_push_url: Option<String>,

    /// Poller and retry settings
    pub outbox: OutboxConfig,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
            api_bind_addr: std::env::var("API_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            webhook_push_url: std::env::var("WEBHOOK_PUSH_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            outbox: OutboxConfig::from_env()?,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> anyhow::Result<T> {
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid number, got '{}'", name, raw)),
        None => Ok(default),
    }
}
