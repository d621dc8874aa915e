//! Per-event dispatch: transport lookup, send with timeout, outcome write-back.
//!
//! Transport errors, timeouts, panics and missing registrations all become a
//! retryable failure for the event at hand and never propagate to the caller.
//! Only a store error escapes `dispatch`, and it concerns this event alone.
//!
//! A send never runs past the claim lease. An event whose lease is already
//! gone is left for the expired-claim sweep, and the send timeout is cut down
//! to whatever remains of the lease.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;

use herald_common::error::AppError;
use herald_common::types::{NotificationEvent, Outcome};

use crate::backoff::BackoffPolicy;
use crate::registry::{Transport, TransportError, TransportRegistry};
use crate::store::EventStore;

/// What happened to one claimed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchReport {
    Sent {
        attempts: u32,
    },
    Retried {
        attempts: u32,
        next_eligible_at: DateTime<Utc>,
    },
    DeadLettered {
        attempts: u32,
    },
    /// The claim was recovered by another poller before we resolved it.
    Stale,
    /// The lease ran out before the send could start; nothing was sent.
    LeaseExpired,
}

pub struct Dispatcher {
    store: Arc<dyn EventStore>,
    registry: TransportRegistry,
    backoff: BackoffPolicy,
    send_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn EventStore>,
        registry: TransportRegistry,
        backoff: BackoffPolicy,
        send_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            backoff,
            send_timeout,
        }
    }

    pub fn registry(&self) -> &TransportRegistry {
        &self.registry
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Send one claimed event and write the outcome back to the store.
    ///
    /// `now` is the moment this dispatch starts on the caller's clock. It is
    /// compared against the lease carried by the claimed copy and is the base
    /// for the retry delay.
    pub async fn dispatch(
        &self,
        event: &NotificationEvent,
        now: DateTime<Utc>,
    ) -> Result<DispatchReport, AppError> {
        let Some(claim_token) = event.claim_token else {
            return Err(AppError::Internal(format!(
                "Event {} dispatched without a claim token",
                event.id
            )));
        };

        // While CLAIMED, next_eligible_at is the lease expiry.
        let Some(remaining) = (event.next_eligible_at - now)
            .to_std()
            .ok()
            .filter(|left| !left.is_zero())
        else {
            tracing::warn!(
                event_id = %event.id,
                lease_expiry = %event.next_eligible_at,
                "Claim lease expired before send, leaving event for recovery"
            );
            return Ok(DispatchReport::LeaseExpired);
        };
        let attempts = event.attempts.saturating_add(1);

        let result = match self.registry.get(&event.channel) {
            Some(transport) => {
                self.send(transport.as_ref(), event, self.send_timeout.min(remaining))
                    .await
            }
            None => Err(TransportError::NoTransport(event.channel.clone())),
        };

        let outcome = match result {
            Ok(()) => Outcome::Sent,
            Err(err) if self.backoff.is_exhausted(attempts) => {
                tracing::warn!(
                    event_id = %event.id,
                    channel = %event.channel,
                    attempts,
                    error = %err,
                    "Delivery attempts exhausted, dead-lettering event"
                );
                Outcome::Dead {
                    reason: err.to_string(),
                }
            }
            Err(err) => {
                let next_eligible_at = self.backoff.next_eligible_at(attempts, now);
                tracing::warn!(
                    event_id = %event.id,
                    channel = %event.channel,
                    attempts,
                    retry_at = %next_eligible_at,
                    error = %err,
                    "Delivery failed, scheduling retry"
                );
                Outcome::FailedRetryable {
                    next_eligible_at,
                    reason: err.to_string(),
                }
            }
        };

        let report = match &outcome {
            Outcome::Sent => DispatchReport::Sent { attempts },
            Outcome::FailedRetryable {
                next_eligible_at, ..
            } => DispatchReport::Retried {
                attempts,
                next_eligible_at: *next_eligible_at,
            },
            Outcome::Dead { .. } => DispatchReport::DeadLettered { attempts },
        };

        if !self.store.resolve(&event.id, claim_token, outcome).await? {
            tracing::debug!(
                event_id = %event.id,
                "Claim was recovered elsewhere, dropping stale result"
            );
            return Ok(DispatchReport::Stale);
        }

        if matches!(report, DispatchReport::Sent { .. }) {
            tracing::debug!(event_id = %event.id, channel = %event.channel, attempts, "Notification sent");
        }

        Ok(report)
    }

    /// Invoke the transport, mapping timeouts and panics onto `TransportError`.
    async fn send(
        &self,
        transport: &dyn Transport,
        event: &NotificationEvent,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let guarded = AssertUnwindSafe(transport.send(event)).catch_unwind();
        match tokio::time::timeout(timeout, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                tracing::error!(
                    event_id = %event.id,
                    transport = transport.name(),
                    "Transport panicked during send"
                );
                Err(TransportError::Panicked)
            }
            Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use herald_common::types::{Channel, EventStatus, NewNotification, Priority};

    use super::*;
    use crate::memory::MemoryEventStore;
    use crate::store::LeaseSettings;

    struct Always(Result<(), TransportError>);

    #[async_trait]
    impl Transport for Always {
        fn name(&self) -> &str {
            "always"
        }

        async fn send(&self, _event: &NotificationEvent) -> Result<(), TransportError> {
            self.0.clone()
        }
    }

    struct Panicking;

    #[async_trait]
    impl Transport for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn send(&self, _event: &NotificationEvent) -> Result<(), TransportError> {
            panic!("boom")
        }
    }

    struct Slow;

    #[async_trait]
    impl Transport for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn send(&self, _event: &NotificationEvent) -> Result<(), TransportError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(200),
            Duration::from_millis(2000),
            Duration::ZERO,
            max_attempts,
        )
        .unwrap()
    }

    async fn claimed_event(
        store: &MemoryEventStore,
        channel: Channel,
    ) -> NotificationEvent {
        let now = Utc::now();
        let request = NewNotification {
            id: "evt-1".to_string(),
            channel,
            priority: Priority::High,
            recipient: "+15550001".to_string(),
            content: "code 1234".to_string(),
        };
        store
            .insert_if_absent(NotificationEvent::pending(request, now))
            .await
            .unwrap();
        store.claim_batch(1, now).await.unwrap().remove(0)
    }

    fn dispatcher(
        store: Arc<MemoryEventStore>,
        registry: TransportRegistry,
        max_attempts: u32,
    ) -> Dispatcher {
        Dispatcher::new(store, registry, policy(max_attempts), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_success_resolves_sent() {
        let store = Arc::new(MemoryEventStore::new(LeaseSettings::default()));
        let event = claimed_event(&store, Channel::sms()).await;
        let registry = TransportRegistry::new().with(Channel::sms(), Arc::new(Always(Ok(()))));

        let report = dispatcher(store.clone(), registry, 5).dispatch(&event, Utc::now()).await.unwrap();
        assert_eq!(report, DispatchReport::Sent { attempts: 1 });

        let stored = store.get("evt-1").await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Sent);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_failure_schedules_backoff() {
        let store = Arc::new(MemoryEventStore::new(LeaseSettings::default()));
        let event = claimed_event(&store, Channel::sms()).await;
        let registry = TransportRegistry::new().with(
            Channel::sms(),
            Arc::new(Always(Err(TransportError::rejected("carrier down")))),
        );

        let before = Utc::now();
        let report = dispatcher(store.clone(), registry, 5).dispatch(&event, Utc::now()).await.unwrap();
        let DispatchReport::Retried {
            attempts,
            next_eligible_at,
        } = report
        else {
            panic!("expected retry, got {report:?}");
        };
        assert_eq!(attempts, 1);
        assert!(next_eligible_at >= before + chrono::Duration::milliseconds(200));

        let stored = store.get("evt-1").await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::FailedRetryable);
        assert_eq!(stored.last_error.as_deref(), Some("delivery rejected: carrier down"));
    }

    #[tokio::test]
    async fn test_exhausted_failure_dead_letters() {
        let store = Arc::new(MemoryEventStore::new(LeaseSettings::default()));
        let event = claimed_event(&store, Channel::sms()).await;
        let registry = TransportRegistry::new().with(
            Channel::sms(),
            Arc::new(Always(Err(TransportError::rejected("invalid number")))),
        );

        let report = dispatcher(store.clone(), registry, 1).dispatch(&event, Utc::now()).await.unwrap();
        assert_eq!(report, DispatchReport::DeadLettered { attempts: 1 });
        assert_eq!(
            store.get("evt-1").await.unwrap().unwrap().status,
            EventStatus::Dead
        );
    }

    #[tokio::test]
    async fn test_missing_transport_is_retryable() {
        let store = Arc::new(MemoryEventStore::new(LeaseSettings::default()));
        let event = claimed_event(&store, Channel::new("carrier-pigeon")).await;

        let report = dispatcher(store.clone(), TransportRegistry::new(), 5)
            .dispatch(&event, Utc::now())
            .await
            .unwrap();
        assert!(matches!(report, DispatchReport::Retried { attempts: 1, .. }));

        let stored = store.get("evt-1").await.unwrap().unwrap();
        assert!(stored.last_error.unwrap().contains("no transport"));
    }

    #[tokio::test]
    async fn test_panicking_transport_is_contained() {
        let store = Arc::new(MemoryEventStore::new(LeaseSettings::default()));
        let event = claimed_event(&store, Channel::push()).await;
        let registry = TransportRegistry::new().with(Channel::push(), Arc::new(Panicking));

        let report = dispatcher(store.clone(), registry, 5).dispatch(&event, Utc::now()).await.unwrap();
        assert!(matches!(report, DispatchReport::Retried { .. }));
        assert_eq!(
            store.get("evt-1").await.unwrap().unwrap().last_error.as_deref(),
            Some("transport panicked")
        );
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let store = Arc::new(MemoryEventStore::new(LeaseSettings::default()));
        let event = claimed_event(&store, Channel::email()).await;
        let registry = TransportRegistry::new().with(Channel::email(), Arc::new(Slow));

        let report = dispatcher(store.clone(), registry, 5).dispatch(&event, Utc::now()).await.unwrap();
        assert!(matches!(report, DispatchReport::Retried { .. }));
        assert_eq!(
            store.get("evt-1").await.unwrap().unwrap().last_error.as_deref(),
            Some("send timed out after 50ms")
        );
    }

    #[tokio::test]
    async fn test_stale_claim_is_dropped() {
        let store = Arc::new(MemoryEventStore::new(LeaseSettings::default()));
        let mut event = claimed_event(&store, Channel::sms()).await;
        event.claim_token = Some(uuid::Uuid::new_v4());
        let registry = TransportRegistry::new().with(Channel::sms(), Arc::new(Always(Ok(()))));

        let report = dispatcher(store.clone(), registry, 5).dispatch(&event, Utc::now()).await.unwrap();
        assert_eq!(report, DispatchReport::Stale);
        assert_eq!(
            store.get("evt-1").await.unwrap().unwrap().status,
            EventStatus::Claimed
        );
    }

    #[tokio::test]
    async fn test_unclaimed_event_is_rejected() {
        let store = Arc::new(MemoryEventStore::new(LeaseSettings::default()));
        let mut event = claimed_event(&store, Channel::sms()).await;
        event.claim_token = None;

        let result = dispatcher(store, TransportRegistry::new(), 5).dispatch(&event, Utc::now()).await;
        assert!(matches!(result, Err(AppError::Internal(_))));
    }

    #[tokio::test]
    async fn test_expired_lease_skips_send() {
        use std::sync::atomic::{AtomicU32, Ordering};

        struct Counting(AtomicU32);

        #[async_trait]
        impl Transport for Counting {
            fn name(&self) -> &str {
                "counting"
            }

            async fn send(&self, _event: &NotificationEvent) -> Result<(), TransportError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let store = Arc::new(MemoryEventStore::new(LeaseSettings::default()));
        let event = claimed_event(&store, Channel::sms()).await;
        let transport = Arc::new(Counting(AtomicU32::new(0)));
        let registry = TransportRegistry::new().with(Channel::sms(), transport.clone());

        let report = dispatcher(store.clone(), registry, 5)
            .dispatch(&event, event.next_eligible_at)
            .await
            .unwrap();
        assert_eq!(report, DispatchReport::LeaseExpired);
        assert_eq!(transport.0.load(Ordering::SeqCst), 0);

        let stored = store.get("evt-1").await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Claimed);
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test]
    async fn test_send_timeout_is_capped_by_lease() {
        let store = Arc::new(MemoryEventStore::new(LeaseSettings {
            claim_lease: Duration::from_millis(20),
            max_attempts: 5,
        }));
        let event = claimed_event(&store, Channel::email()).await;
        let registry = TransportRegistry::new().with(Channel::email(), Arc::new(Slow));

        let dispatcher = Dispatcher::new(store.clone(), registry, policy(5), Duration::from_secs(5));
        let claimed_at = event.next_eligible_at - chrono::Duration::milliseconds(20);
        let report = dispatcher.dispatch(&event, claimed_at).await.unwrap();

        assert!(matches!(report, DispatchReport::Retried { attempts: 1, .. }));
        assert_eq!(
            store.get("evt-1").await.unwrap().unwrap().last_error.as_deref(),
            Some("send timed out after 20ms")
        );
    }

    #[tokio::test]
    async fn test_retry_delay_uses_dispatch_clock() {
        let store = Arc::new(MemoryEventStore::new(LeaseSettings::default()));
        let event = claimed_event(&store, Channel::sms()).await;
        let registry = TransportRegistry::new().with(
            Channel::sms(),
            Arc::new(Always(Err(TransportError::rejected("busy")))),
        );

        let started = event.next_eligible_at - chrono::Duration::seconds(5);
        let report = dispatcher(store, registry, 5)
            .dispatch(&event, started)
            .await
            .unwrap();
        assert_eq!(
            report,
            DispatchReport::Retried {
                attempts: 1,
                next_eligible_at: started + chrono::Duration::milliseconds(200),
            }
        );
    }
}
