//! Post-commit delivery of accumulated messages.
//!
//! Implements the two-phase hook contract of the outbox transaction: the
//! pre-commit step writes the relay safety delay, the post-commit step
//! attempts best-effort immediate delivery. Delivery failures here are
//! never fatal to the caller; its transaction has already committed by the
//! time sending is attempted.

use outbox_core::{storage::StoreTransaction, DeferredMessage};
use tracing::{debug, error, warn};

use crate::{
    config::to_chrono,
    error::Result,
    metrics::DeliveryType,
    outbox::TransactionalOutbox,
    sender::transmit,
};

/// Per-transaction delivery hooks, driven by the outbox transaction handle.
pub(crate) struct PostCommitSender<'a> {
    outbox: &'a TransactionalOutbox,
}

impl<'a> PostCommitSender<'a> {
    pub(crate) fn new(outbox: &'a TransactionalOutbox) -> Self {
        Self { outbox }
    }

    /// Pre-commit step: push `schedule_after` past the whole batch's send
    /// budget.
    ///
    /// `delay = max_duration_send_immediately * accumulated count`. If the
    /// post-commit attempt crashes or times out, the relay must not race to
    /// redeliver before that deadline, since the in-flight attempt may
    /// still complete. The bound assumes every send uses its full budget,
    /// so it is conservative when sends fail fast.
    pub(crate) async fn before_commit(
        &self,
        tx: &mut Box<dyn StoreTransaction>,
        accumulated: &mut [DeferredMessage],
    ) -> Result<()> {
        if accumulated.is_empty() {
            return Ok(());
        }

        let per_attempt = self.outbox.config.max_duration_send_immediately();
        let delay = per_attempt.saturating_mul(accumulated.len() as u32);
        let schedule_after = self.outbox.clock.now_utc() + to_chrono(delay);

        for message in accumulated.iter_mut() {
            tx.set_schedule_after(message.id, schedule_after).await?;
            message.schedule_after = Some(schedule_after);
        }

        debug!(
            count = accumulated.len(),
            %schedule_after,
            "set relay safety delay for messages pending immediate delivery"
        );
        Ok(())
    }

    /// Post-commit step: deliver the accumulated messages in registration
    /// order.
    ///
    /// Success and message-caused failures are persisted in their own short
    /// transactions. Any other failure stops processing the remaining
    /// messages entirely for this commit; they stay ready and the relay
    /// picks them up once `schedule_after` elapses.
    pub(crate) async fn after_commit(&self, accumulated: &[DeferredMessage]) {
        let mut sent = 0usize;

        for message in accumulated {
            let sender = self.outbox.sender_provider.resolve(message);
            self.outbox.tracing.restore(message.trace_context.as_ref());

            let started = self.outbox.clock.now();
            let budget = self.outbox.config.max_duration_send_immediately();
            let result = transmit(sender.as_ref(), message, DeliveryType::Immediate, budget).await;
            self.outbox
                .metrics
                .record_transmit(DeliveryType::Immediate, self.outbox.clock.now() - started);

            match result {
                Ok(()) => {
                    let sent_at = self.outbox.clock.now_utc();
                    if let Err(store_error) =
                        self.outbox.store.mark_sent_immediately(message.id, sent_at).await
                    {
                        warn!(
                            deferred_message_id = message.id,
                            error = %store_error,
                            unsent = accumulated.len() - sent,
                            "unable to record immediate send, deferring remaining messages to \
                             the relay"
                        );
                        return;
                    }
                    sent += 1;
                    debug!(
                        deferred_message_id = message.id,
                        topic = %message.topic,
                        "sent deferred message immediately after transaction commit"
                    );
                },
                Err(send_error) if send_error.caused_by_message() => {
                    error!(
                        deferred_message_id = message.id,
                        topic = %message.topic,
                        message_id = %message.message_id,
                        error = %send_error,
                        "deferred message has an error and cannot be sent, marking it failed"
                    );
                    let failed_at = self.outbox.clock.now_utc();
                    if let Err(store_error) = self
                        .outbox
                        .store
                        .mark_failed(message.id, failed_at, send_error.reason())
                        .await
                    {
                        warn!(
                            deferred_message_id = message.id,
                            error = %store_error,
                            unsent = accumulated.len() - sent,
                            "unable to record send failure, deferring remaining messages to \
                             the relay"
                        );
                        return;
                    }
                },
                Err(send_error) => {
                    warn!(
                        deferred_message_id = message.id,
                        error = %send_error,
                        unsent = accumulated.len() - sent,
                        "unable to send all deferred messages immediately after transaction \
                         commit, deferring the rest to the relay"
                    );
                    return;
                },
            }
        }
    }
}
