//! Scheduled relay: poll-driven background delivery sweep.
//!
//! Delivers every message not yet sent, in id order, until the backlog is
//! drained or the run's time budget expires. Cross-instance mutual
//! exclusion is the scheduler's responsibility; a single run assumes it is
//! the only one active cluster-wide.

use std::sync::Arc;

use outbox_core::{Clock, DeferredMessage, OutboxStore, RealClock};
use tracing::{debug, error};

use crate::{
    config::{to_chrono, OutboxConfig},
    error::Result,
    metrics::{DeliveryType, NoopMetrics, OutboxMetrics},
    sender::{transmit, SenderProvider},
    trace::OutboxTracing,
};

/// Outcome of one relay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayRunSummary {
    /// Messages delivered and marked sent.
    pub sent: u64,
    /// Messages marked failed because of a message-caused send failure.
    pub failed: u64,
    /// Whether the run aborted on an infrastructure failure. Remaining
    /// fetched messages were left untouched for the next run.
    pub aborted: bool,
    /// Whether the run stopped on its deadline with messages still ready.
    ///
    /// A voluntary yield, not an error: the run must end well inside the
    /// relay lock's validity window, the next run continues the backlog.
    pub deadline_reached: bool,
}

enum MessageOutcome {
    Sent,
    MarkedFailed,
    Abort(String),
}

/// The message relay.
pub struct MessageRelay {
    store: Arc<dyn OutboxStore>,
    sender_provider: Arc<SenderProvider>,
    tracing: OutboxTracing,
    metrics: Arc<dyn OutboxMetrics>,
    config: OutboxConfig,
    clock: Arc<dyn Clock>,
}

impl MessageRelay {
    /// Creates a relay over the given store and sender provider.
    pub fn new(
        store: Arc<dyn OutboxStore>,
        sender_provider: Arc<SenderProvider>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            store,
            sender_provider,
            tracing: OutboxTracing::disabled(),
            metrics: Arc::new(NoopMetrics),
            config,
            clock: Arc::new(RealClock),
        }
    }

    /// Sets the tracing capture/restore collaborators.
    pub fn with_tracing(mut self, tracing: OutboxTracing) -> Self {
        self.tracing = tracing;
        self
    }

    /// Sets the metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn OutboxMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Sets the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Performs one relay run.
    ///
    /// Fetches batches of ready messages ordered by id and attempts each in
    /// order with the scheduled timeout profile. A message-caused failure
    /// marks that single message failed and continues; any other failure
    /// aborts the run, leaving the remaining fetched messages untouched for
    /// the next scheduled run.
    ///
    /// # Errors
    ///
    /// Returns an error when fetching ready messages fails. Send failures
    /// never surface here; they are resolved into message state or recorded
    /// on the summary.
    pub async fn relay(&self) -> Result<RelayRunSummary> {
        debug!("starting to relay deferred messages");
        let deadline = self.clock.now_utc() + to_chrono(self.config.continuous_relay_timeout);
        debug!(%deadline, "will stop relaying at the deadline");

        let mut summary = RelayRunSummary::default();

        loop {
            let now = self.clock.now_utc();
            if now >= deadline {
                // Give the lock back; the next scheduled run continues.
                summary.deadline_reached = true;
                debug!("continuous relay timeout reached, ending this relay run");
                break;
            }

            debug!(
                batch_size = self.config.relay_batch_size,
                "fetching deferred messages ready to be sent"
            );
            let messages = self.store.find_ready(self.config.relay_batch_size, now).await?;
            if messages.is_empty() {
                debug!("there are no deferred messages ready to be sent");
                break;
            }

            debug!(count = messages.len(), "fetched a batch of deferred messages to send");
            for message in &messages {
                match self.send_message(message).await {
                    MessageOutcome::Sent => summary.sent += 1,
                    MessageOutcome::MarkedFailed => summary.failed += 1,
                    MessageOutcome::Abort(cause) => {
                        error!(
                            error = %cause,
                            "unable to send the complete batch of fetched deferred messages, \
                             aborting this relay run"
                        );
                        summary.aborted = true;
                        return Ok(summary);
                    },
                }
            }
        }

        debug!(
            sent = summary.sent,
            failed = summary.failed,
            "ending relaying of deferred messages"
        );
        Ok(summary)
    }

    async fn send_message(&self, message: &DeferredMessage) -> MessageOutcome {
        let sender = self.sender_provider.resolve(message);
        self.tracing.restore(message.trace_context.as_ref());

        let started = self.clock.now();
        let budget = self.config.max_duration_send_scheduled();
        let result = transmit(sender.as_ref(), message, DeliveryType::Scheduled, budget).await;
        self.metrics.record_transmit(DeliveryType::Scheduled, self.clock.now() - started);

        match result {
            Ok(()) => {
                let sent_at = self.clock.now_utc();
                match self.store.mark_sent_scheduled(message.id, sent_at).await {
                    Ok(()) => {
                        debug!(
                            deferred_message_id = message.id,
                            topic = %message.topic,
                            "relayed deferred message"
                        );
                        MessageOutcome::Sent
                    },
                    Err(store_error) => MessageOutcome::Abort(store_error.to_string()),
                }
            },
            Err(send_error) if send_error.caused_by_message() => {
                error!(
                    deferred_message_id = message.id,
                    topic = %message.topic,
                    message_id = %message.message_id,
                    error = %send_error,
                    "deferred message has an error and cannot be sent, marking it failed"
                );
                let failed_at = self.clock.now_utc();
                match self.store.mark_failed(message.id, failed_at, send_error.reason()).await {
                    Ok(()) => MessageOutcome::MarkedFailed,
                    Err(store_error) => MessageOutcome::Abort(store_error.to_string()),
                }
            },
            Err(send_error) => MessageOutcome::Abort(send_error.to_string()),
        }
    }
}

impl std::fmt::Debug for MessageRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRelay")
            .field("sender_provider", &self.sender_provider)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
