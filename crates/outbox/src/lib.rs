//! Durable outbox delivery engine.
//!
//! Producers enqueue notifications idempotently; one or more schedulers claim
//! priority-ordered batches from a shared [`EventStore`], hand each claimed
//! event to the [`TransportRegistry`] through the [`Dispatcher`], and write the
//! outcome back. Failures are retried with capped exponential backoff until the
//! attempt budget is spent, after which the event is dead-lettered.
//!
//! ```text
//! producer -> Outbox::enqueue -> store (pending)
//!          -> Scheduler: sweep -> claim_batch -> Dispatcher -> Transport
//!          -> store.resolve (sent | failed_retryable | dead)
//! ```

pub mod backoff;
pub mod dispatcher;
pub mod enqueue;
pub mod memory;
pub mod postgres;
pub mod registry;
pub mod scheduler;
pub mod store;

pub use backoff::BackoffPolicy;
pub use dispatcher::{DispatchReport, Dispatcher};
pub use enqueue::{EnqueueResult, Outbox};
pub use memory::MemoryEventStore;
pub use postgres::PgEventStore;
pub use registry::{Transport, TransportError, TransportRegistry};
pub use scheduler::{CycleReport, Phase, Scheduler};
pub use store::{EventStore, LeaseSettings};
