//! Metrics sink contract for outbox observability.
//!
//! The sink itself is a collaborator: the host application bridges these
//! callbacks into whatever metrics system it runs. [`AtomicOutboxMetrics`]
//! is an in-process implementation useful for tests and for exposing a
//! snapshot without an external sink.

use std::{
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
    time::Duration,
};

/// Which delivery path a measurement belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryType {
    /// Post-commit delivery in the enqueuing task.
    Immediate,
    /// Periodic relay delivery.
    Scheduled,
}

/// Final outcome of the transaction a message was enqueued in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxOutcome {
    /// The transaction committed.
    Committed,
    /// The transaction rolled back.
    RolledBack,
    /// The outcome could not be determined, e.g. the handle was dropped
    /// without an explicit completion.
    Unknown,
}

/// Counters and gauges emitted by the outbox.
pub trait OutboxMetrics: Send + Sync {
    /// Counts messages posted to the outbox, tagged by delivery type and
    /// the eventual transaction outcome.
    fn count_posts(&self, delivery: DeliveryType, outcome: TxOutcome, count: u64);

    /// Records the duration of one transport send attempt.
    fn record_transmit(&self, delivery: DeliveryType, elapsed: Duration);

    /// Updates the gauges derived from persistent storage: the number of
    /// messages ready to be sent (the relay lag) and the failed-message
    /// counts by resend flag.
    fn update_gauges(&self, ready: i64, failed_resend_disabled: i64, failed_resend_enabled: i64);
}

/// Metrics sink that discards all measurements.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl OutboxMetrics for NoopMetrics {
    fn count_posts(&self, _delivery: DeliveryType, _outcome: TxOutcome, _count: u64) {}

    fn record_transmit(&self, _delivery: DeliveryType, _elapsed: Duration) {}

    fn update_gauges(&self, _ready: i64, _failed_resend_disabled: i64, _failed_resend_enabled: i64) {
    }
}

/// Point-in-time view of [`AtomicOutboxMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Immediate posts whose transaction committed.
    pub posts_immediate_committed: u64,
    /// Immediate posts whose transaction rolled back.
    pub posts_immediate_rolled_back: u64,
    /// Immediate posts with unknown transaction outcome.
    pub posts_immediate_unknown: u64,
    /// Scheduled posts whose transaction committed.
    pub posts_scheduled_committed: u64,
    /// Scheduled posts whose transaction rolled back.
    pub posts_scheduled_rolled_back: u64,
    /// Scheduled posts with unknown transaction outcome.
    pub posts_scheduled_unknown: u64,
    /// Transport send attempts on the immediate path.
    pub transmits_immediate: u64,
    /// Transport send attempts on the scheduled path.
    pub transmits_scheduled: u64,
    /// Messages currently ready to be sent.
    pub ready_to_be_sent: i64,
    /// Failed messages without a resend request.
    pub failed_resend_disabled: i64,
    /// Failed messages marked for resend.
    pub failed_resend_enabled: i64,
}

/// Atomic in-process metrics sink.
#[derive(Debug, Default)]
pub struct AtomicOutboxMetrics {
    posts_immediate_committed: AtomicU64,
    posts_immediate_rolled_back: AtomicU64,
    posts_immediate_unknown: AtomicU64,
    posts_scheduled_committed: AtomicU64,
    posts_scheduled_rolled_back: AtomicU64,
    posts_scheduled_unknown: AtomicU64,
    transmits_immediate: AtomicU64,
    transmits_scheduled: AtomicU64,
    ready_to_be_sent: AtomicI64,
    failed_resend_disabled: AtomicI64,
    failed_resend_enabled: AtomicI64,
}

impl AtomicOutboxMetrics {
    /// Creates a zeroed metrics sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a consistent-enough snapshot of all values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            posts_immediate_committed: self.posts_immediate_committed.load(Ordering::Relaxed),
            posts_immediate_rolled_back: self.posts_immediate_rolled_back.load(Ordering::Relaxed),
            posts_immediate_unknown: self.posts_immediate_unknown.load(Ordering::Relaxed),
            posts_scheduled_committed: self.posts_scheduled_committed.load(Ordering::Relaxed),
            posts_scheduled_rolled_back: self.posts_scheduled_rolled_back.load(Ordering::Relaxed),
            posts_scheduled_unknown: self.posts_scheduled_unknown.load(Ordering::Relaxed),
            transmits_immediate: self.transmits_immediate.load(Ordering::Relaxed),
            transmits_scheduled: self.transmits_scheduled.load(Ordering::Relaxed),
            ready_to_be_sent: self.ready_to_be_sent.load(Ordering::Relaxed),
            failed_resend_disabled: self.failed_resend_disabled.load(Ordering::Relaxed),
            failed_resend_enabled: self.failed_resend_enabled.load(Ordering::Relaxed),
        }
    }
}

impl OutboxMetrics for AtomicOutboxMetrics {
    fn count_posts(&self, delivery: DeliveryType, outcome: TxOutcome, count: u64) {
        let counter = match (delivery, outcome) {
            (DeliveryType::Immediate, TxOutcome::Committed) => &self.posts_immediate_committed,
            (DeliveryType::Immediate, TxOutcome::RolledBack) => &self.posts_immediate_rolled_back,
            (DeliveryType::Immediate, TxOutcome::Unknown) => &self.posts_immediate_unknown,
            (DeliveryType::Scheduled, TxOutcome::Committed) => &self.posts_scheduled_committed,
            (DeliveryType::Scheduled, TxOutcome::RolledBack) => &self.posts_scheduled_rolled_back,
            (DeliveryType::Scheduled, TxOutcome::Unknown) => &self.posts_scheduled_unknown,
        };
        counter.fetch_add(count, Ordering::Relaxed);
    }

    fn record_transmit(&self, delivery: DeliveryType, _elapsed: Duration) {
        let counter = match delivery {
            DeliveryType::Immediate => &self.transmits_immediate,
            DeliveryType::Scheduled => &self.transmits_scheduled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn update_gauges(&self, ready: i64, failed_resend_disabled: i64, failed_resend_enabled: i64) {
        self.ready_to_be_sent.store(ready, Ordering::Relaxed);
        self.failed_resend_disabled.store(failed_resend_disabled, Ordering::Relaxed);
        self.failed_resend_enabled.store(failed_resend_enabled, Ordering::Relaxed);
    }
}
