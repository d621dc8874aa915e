//! Poll loop: sweep expired claims, claim a batch, dispatch it, wait.
//!
//! Each cycle moves through `Idle -> Claiming -> Dispatching -> Idle`. The
//! shutdown token is only observed between cycles, so a batch that has been
//! claimed is always dispatched and resolved before the loop exits. Store
//! failures abandon the current cycle and are retried on the next tick.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::stream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use herald_common::config::OutboxConfig;
use herald_common::error::AppError;

use crate::backoff::BackoffPolicy;
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::registry::TransportRegistry;
use crate::store::EventStore;

/// Where the scheduler currently is within a poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Claiming,
    Dispatching,
}

/// Tally of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Expired claims turned back into retryable (or dead) work.
    pub recovered: u64,
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Results dropped because another poller had recovered the claim.
    pub stale: usize,
    /// Events not sent because their lease ran out while waiting for a slot.
    pub lease_expired: usize,
    /// Events whose outcome could not be written; their lease will expire.
    pub errors: usize,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.recovered == 0 && self.claimed == 0
    }
}

pub struct Scheduler {
    store: Arc<dyn EventStore>,
    dispatcher: Dispatcher,
    batch_size: usize,
    worker_limit: usize,
    poll_interval: Duration,
    phase: watch::Sender<Phase>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn EventStore>,
        dispatcher: Dispatcher,
        batch_size: usize,
        worker_limit: usize,
        poll_interval: Duration,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            store,
            dispatcher,
            batch_size: batch_size.max(1),
            worker_limit: worker_limit.max(1),
            poll_interval,
            phase,
        }
    }

    /// Build a scheduler and its dispatcher from validated configuration.
    ///
    /// Malformed settings are reported here, before any cycle runs.
    pub fn from_config(
        store: Arc<dyn EventStore>,
        registry: TransportRegistry,
        config: &OutboxConfig,
    ) -> Result<Self, AppError> {
        config.validate()?;
        let backoff = BackoffPolicy::from_config(config)?;
        let dispatcher = Dispatcher::new(store.clone(), registry, backoff, config.send_timeout());
        Ok(Self::new(
            store,
            dispatcher,
            config.batch_size,
            config.worker_limit,
            config.poll_interval(),
        ))
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Observe phase changes (e.g. for health reporting).
    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Run one full cycle against the store as of `now`.
    ///
    /// Returns an error only when the sweep or the claim itself failed; in that
    /// case no event was mutated by this cycle.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport, AppError> {
        let started = Instant::now();
        let mut report = CycleReport::default();

        self.phase.send_replace(Phase::Claiming);
        let claimed = async {
            report.recovered = self.store.requeue_expired_claims(now).await?;
            if report.recovered > 0 {
                tracing::info!(recovered = report.recovered, "Recovered expired claims");
            }
            self.store.claim_batch(self.batch_size, now).await
        }
        .await;
        let claimed = match claimed {
            Ok(claimed) => claimed,
            Err(e) => {
                self.phase.send_replace(Phase::Idle);
                return Err(e);
            }
        };
        report.claimed = claimed.len();

        self.phase.send_replace(Phase::Dispatching);
        let results: Vec<(String, Result<DispatchReport, AppError>)> = stream::iter(claimed)
            .map(move |event| async move {
                let at = advance(now, started.elapsed());
                let result = self.dispatcher.dispatch(&event, at).await;
                (event.id, result)
            })
            .buffer_unordered(self.worker_limit)
            .collect()
            .await;

        for (event_id, result) in results {
            match result {
                Ok(DispatchReport::Sent { .. }) => report.sent += 1,
                Ok(DispatchReport::Retried { .. }) => report.retried += 1,
                Ok(DispatchReport::DeadLettered { .. }) => report.dead_lettered += 1,
                Ok(DispatchReport::Stale) => report.stale += 1,
                Ok(DispatchReport::LeaseExpired) => report.lease_expired += 1,
                Err(e) => {
                    tracing::error!(
                        event_id = %event_id,
                        error = %e,
                        "Failed to record dispatch outcome, claim will expire"
                    );
                    report.errors += 1;
                }
            }
        }

        self.phase.send_replace(Phase::Idle);
        Ok(report)
    }

    /// Poll until `shutdown` is cancelled.
    ///
    /// A full batch is followed immediately by another cycle; otherwise the
    /// loop waits `poll_interval` or until shutdown, whichever comes first.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            batch_size = self.batch_size,
            worker_limit = self.worker_limit,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            channels = ?self.dispatcher.registry().channels(),
            "Outbox scheduler started"
        );

        while !shutdown.is_cancelled() {
            let backlog = match self.run_cycle(Utc::now()).await {
                Ok(report) => {
                    if report.is_idle() {
                        tracing::debug!("Poll cycle found no work");
                    } else {
                        tracing::info!(
                            recovered = report.recovered,
                            claimed = report.claimed,
                            sent = report.sent,
                            retried = report.retried,
                            dead_lettered = report.dead_lettered,
                            stale = report.stale,
                            lease_expired = report.lease_expired,
                            errors = report.errors,
                            "Poll cycle complete"
                        );
                    }
                    report.claimed >= self.batch_size
                }
                Err(e) if e.is_store_unavailable() => {
                    tracing::warn!(error = %e, "Event store unavailable, retrying next interval");
                    false
                }
                Err(e) => {
                    tracing::error!(error = %e, "Poll cycle failed, retrying next interval");
                    false
                }
            };

            if backlog {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        tracing::info!("Outbox scheduler stopped");
    }
}

/// `now` moved forward by the wall-clock time spent so far in the cycle.
fn advance(now: DateTime<Utc>, elapsed: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(elapsed)
        .ok()
        .and_then(|elapsed| now.checked_add_signed(elapsed))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
