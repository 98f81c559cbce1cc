//! Transactional outbox engine.
//!
//! Guarantees that a message is published to the transport if and only if
//! the database transaction that produced it committed, without a
//! distributed transaction across the database and the transport. Messages
//! are persisted with the caller's data in the same transaction; after the
//! commit they are delivered either immediately in the committing task or
//! later by the periodic relay. Delivery is at-least-once, never before
//! commit and never silently dropped.
//!
//! Sending immediately minimizes latency and scales with the number of
//! application instances. Scheduled sending costs less in the enqueuing
//! task but adds latency and is serialized cluster-wide; it also picks up
//! whatever an instance that died mid-send left behind. Instances that
//! only serve requests can disable the scheduled relay and leave it to
//! dedicated relay instances.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod housekeeping;
pub mod lock;
pub mod message;
pub mod metrics;
pub mod outbox;
pub mod relay;
pub mod scheduler;
pub mod sender;
pub mod trace;

mod post_commit;

pub use config::OutboxConfig;
pub use error::{OutboxError, Result, SendError};
pub use housekeeping::{Housekeeping, HousekeepingSummary};
pub use lock::{LocalLockService, LockGuard, LockLease, LockService};
pub use message::{
    AllowAllContracts, CollaboratorError, ContractValidator, MessageCodec, MessageKey,
    OutboxMessage, SendObserver,
};
pub use metrics::{
    AtomicOutboxMetrics, DeliveryType, MetricsSnapshot, NoopMetrics, OutboxMetrics, TxOutcome,
};
pub use outbox::{OutboxBuilder, OutboxTransaction, TransactionalOutbox};
pub use relay::{MessageRelay, RelayRunSummary};
pub use scheduler::{
    HousekeepingScheduler, MetricsUpdateScheduler, RelayScheduler, HOUSEKEEPING_LOCK_NAME,
    RELAY_LOCK_NAME,
};
pub use sender::{MessageSender, SenderProvider};
pub use trace::{OutboxTracing, TraceContextProvider, TraceContextUpdater};
