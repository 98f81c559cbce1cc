//! Periodic drivers for the relay, housekeeping and metrics updates.
//!
//! Each scheduler is a plain async loop the host application spawns; all
//! loops stop on the shared cancellation token. The relay and housekeeping
//! loops wrap every invocation in the distributed lock so at most one
//! instance runs a given task cluster-wide; an unavailable lock just skips
//! the cycle.

use std::{sync::Arc, time::Duration};

use outbox_core::{Clock, OutboxStore, RealClock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::OutboxConfig,
    housekeeping::Housekeeping,
    lock::LockService,
    metrics::OutboxMetrics,
    relay::MessageRelay,
};

/// Cluster-wide lock name serializing relay runs.
pub const RELAY_LOCK_NAME: &str = "outbox-message-relay-tasks";

/// Cluster-wide lock name serializing housekeeping runs.
pub const HOUSEKEEPING_LOCK_NAME: &str = "outbox-message-house-keeping-tasks";

/// Minimum hold for the housekeeping lock.
const HOUSEKEEPING_LOCK_MIN_HOLD: Duration = Duration::from_secs(5);

/// Maximum hold for the housekeeping lock.
const HOUSEKEEPING_LOCK_MAX_HOLD: Duration = Duration::from_secs(2 * 60 * 60);

/// Periodic relay driver.
pub struct RelayScheduler {
    relay: Arc<MessageRelay>,
    lock_service: Arc<dyn LockService>,
    config: OutboxConfig,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl RelayScheduler {
    /// Creates a relay scheduler.
    pub fn new(
        relay: Arc<MessageRelay>,
        lock_service: Arc<dyn LockService>,
        config: OutboxConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self { relay, lock_service, config, clock: Arc::new(RealClock), shutdown }
    }

    /// Sets the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Maximum validity of the relay lock.
    ///
    /// A run is expected to take at most `continuous_relay_timeout` plus
    /// one full batch of scheduled sends; the batch part carries a 1.5x
    /// safety factor. Kept as small as possible, because it is also how
    /// long a failed instance blocks the relay for everyone else.
    pub fn lock_max_hold(&self) -> Duration {
        let batch_budget = self
            .config
            .max_duration_send_scheduled()
            .saturating_mul(self.config.relay_batch_size.saturating_mul(3))
            / 2;
        self.config.continuous_relay_timeout + batch_budget
    }

    /// Runs the scheduling loop until cancelled.
    ///
    /// Does nothing when the scheduled relay is disabled; such instances
    /// only serve the enqueue API and the post-commit path.
    pub async fn run(&self) {
        if !self.config.scheduled_relay_enabled {
            info!("scheduled relay is disabled, relay scheduler not starting");
            return;
        }

        info!(poll_delay = ?self.config.poll_delay, "relay scheduler starting");
        // Starting a new relay task sooner than half a poll delay after the
        // previous one started is pointless churn, hence the minimum hold.
        let min_hold = self.config.poll_delay / 2;
        let max_hold = self.lock_max_hold();

        loop {
            tokio::select! {
                () = self.clock.sleep(self.config.poll_delay) => {},
                () = self.shutdown.cancelled() => break,
            }

            match self.lock_service.try_acquire(RELAY_LOCK_NAME, min_hold, max_hold).await {
                Some(_lease) => {
                    if let Err(relay_error) = self.relay.relay().await {
                        error!(error = %relay_error, "relay run failed");
                    }
                },
                None => debug!("relay lock unavailable, skipping this cycle"),
            }
        }

        info!("relay scheduler stopped");
    }
}

/// Periodic housekeeping driver.
pub struct HousekeepingScheduler {
    housekeeping: Arc<Housekeeping>,
    lock_service: Arc<dyn LockService>,
    config: OutboxConfig,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl HousekeepingScheduler {
    /// Creates a housekeeping scheduler.
    pub fn new(
        housekeeping: Arc<Housekeeping>,
        lock_service: Arc<dyn LockService>,
        config: OutboxConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self { housekeeping, lock_service, config, clock: Arc::new(RealClock), shutdown }
    }

    /// Sets the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the scheduling loop until cancelled.
    pub async fn run(&self) {
        info!(
            interval = ?self.config.housekeeping_interval,
            "housekeeping scheduler starting"
        );

        loop {
            tokio::select! {
                () = self.clock.sleep(self.config.housekeeping_interval) => {},
                () = self.shutdown.cancelled() => break,
            }

            match self
                .lock_service
                .try_acquire(
                    HOUSEKEEPING_LOCK_NAME,
                    HOUSEKEEPING_LOCK_MIN_HOLD,
                    HOUSEKEEPING_LOCK_MAX_HOLD,
                )
                .await
            {
                Some(_lease) => {
                    if let Err(housekeeping_error) = self.housekeeping.delete_old_messages().await
                    {
                        error!(error = %housekeeping_error, "housekeeping run failed");
                    }
                },
                None => debug!("housekeeping lock unavailable, skipping this cycle"),
            }
        }

        info!("housekeeping scheduler stopped");
    }
}

/// Periodic refresh of the storage-derived gauges.
///
/// Gauges are per-instance; no cross-instance lock is involved.
pub struct MetricsUpdateScheduler {
    store: Arc<dyn OutboxStore>,
    metrics: Arc<dyn OutboxMetrics>,
    config: OutboxConfig,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl MetricsUpdateScheduler {
    /// Creates a metrics update scheduler.
    pub fn new(
        store: Arc<dyn OutboxStore>,
        metrics: Arc<dyn OutboxMetrics>,
        config: OutboxConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self { store, metrics, config, clock: Arc::new(RealClock), shutdown }
    }

    /// Sets the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Refreshes the gauges once.
    ///
    /// # Errors
    ///
    /// Returns an error when a store query fails.
    pub async fn update_once(&self) -> crate::error::Result<()> {
        let now = self.clock.now_utc();
        let ready = self.store.count_ready(now).await?;
        let failed_resend_disabled = self.store.count_failed(false).await?;
        let failed_resend_enabled = self.store.count_failed(true).await?;
        self.metrics.update_gauges(ready, failed_resend_disabled, failed_resend_enabled);
        Ok(())
    }

    /// Runs the scheduling loop until cancelled.
    pub async fn run(&self) {
        loop {
            tokio::select! {
                () = self.clock.sleep(self.config.metrics_update_interval) => {},
                () = self.shutdown.cancelled() => break,
            }

            if let Err(update_error) = self.update_once().await {
                warn!(error = %update_error, "metrics gauge update failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_lock_max_hold_covers_timeout_plus_one_batch() {
        let config = OutboxConfig::default();
        let relay = Arc::new(MessageRelay::new(
            Arc::new(outbox_core::MemoryOutboxStore::new()),
            Arc::new(crate::sender::SenderProvider::single(
                "default",
                Arc::new(NeverSender),
            )),
            config.clone(),
        ));
        let scheduler = RelayScheduler::new(
            relay,
            Arc::new(crate::lock::LocalLockService::new()),
            config.clone(),
            CancellationToken::new(),
        );

        // 5 min relay budget + 75 s per send * 5 per batch * 3 / 2.
        let expected = config.continuous_relay_timeout
            + config.max_duration_send_scheduled().saturating_mul(15) / 2;
        assert_eq!(scheduler.lock_max_hold(), expected);
    }

    struct NeverSender;

    impl crate::sender::MessageSender for NeverSender {
        fn send_immediate<'a>(
            &'a self,
            _message: &'a outbox_core::DeferredMessage,
        ) -> outbox_core::storage::BoxFuture<'a, Result<(), crate::error::SendError>> {
            Box::pin(async { Ok(()) })
        }

        fn send_scheduled<'a>(
            &'a self,
            _message: &'a outbox_core::DeferredMessage,
        ) -> outbox_core::storage::BoxFuture<'a, Result<(), crate::error::SendError>> {
            Box::pin(async { Ok(()) })
        }
    }
}
