//! The transactional outbox enqueue API.
//!
//! Messages are persisted in the caller's transaction and sent only after
//! that transaction committed; a rolled-back transaction sends nothing.
//! Two delivery paths exist: immediate sending right after commit in the
//! committing task, and scheduled sending by the periodic relay. If
//! immediate sending fails the message is not lost, the relay picks it up
//! later after a safety delay.
//!
//! The per-transaction state lives on an explicit [`OutboxTransaction`]
//! handle the caller threads through its transaction scope; there is no
//! global registry keyed by an ambient transaction.

use std::sync::Arc;

use outbox_core::{
    storage::StoreTransaction, Clock, DeferredMessage, FailedMessage, NewDeferredMessage,
    OutboxStore, RealClock,
};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{
    config::OutboxConfig,
    error::{OutboxError, Result},
    message::{AllowAllContracts, ContractValidator, MessageCodec, MessageKey, OutboxMessage, SendObserver},
    metrics::{DeliveryType, NoopMetrics, OutboxMetrics, TxOutcome},
    post_commit::PostCommitSender,
    sender::SenderProvider,
    trace::OutboxTracing,
};

/// The transactional outbox.
///
/// Holds the collaborators shared by every outbox transaction and exposes
/// the failed-message query and resend API. Cheap to share behind an
/// [`Arc`].
pub struct TransactionalOutbox {
    pub(crate) store: Arc<dyn OutboxStore>,
    pub(crate) sender_provider: Arc<SenderProvider>,
    pub(crate) codec: Arc<dyn MessageCodec>,
    pub(crate) contract_validator: Arc<dyn ContractValidator>,
    pub(crate) tracing: OutboxTracing,
    pub(crate) metrics: Arc<dyn OutboxMetrics>,
    pub(crate) observers: Vec<Arc<dyn SendObserver>>,
    pub(crate) config: OutboxConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) cluster_name: Option<String>,
}

impl TransactionalOutbox {
    /// Starts building an outbox over the given store, sender provider and
    /// codec.
    pub fn builder(
        store: Arc<dyn OutboxStore>,
        sender_provider: Arc<SenderProvider>,
        codec: Arc<dyn MessageCodec>,
    ) -> OutboxBuilder {
        OutboxBuilder {
            store,
            sender_provider,
            codec,
            contract_validator: Arc::new(AllowAllContracts),
            tracing: OutboxTracing::disabled(),
            metrics: Arc::new(NoopMetrics),
            observers: Vec::new(),
            config: OutboxConfig::default(),
            clock: Arc::new(RealClock),
            cluster_name: None,
        }
    }

    /// Begins a new outbox transaction.
    ///
    /// The returned handle carries the open store transaction and the
    /// accumulator of messages pending immediate delivery. Complete it with
    /// [`OutboxTransaction::commit`] or [`OutboxTransaction::rollback`].
    pub async fn transaction(&self) -> Result<OutboxTransaction<'_>> {
        let tx = self.store.begin().await?;
        Ok(OutboxTransaction {
            outbox: self,
            tx: Some(tx),
            accumulated: Vec::new(),
            immediate_count: 0,
            scheduled_count: 0,
            completed: false,
        })
    }

    /// The engine configuration.
    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Counts messages in state 'failed' by resend flag.
    pub async fn count_failed_messages(&self, resend: bool) -> Result<i64> {
        Ok(self.store.count_failed(resend).await?)
    }

    /// Counts messages that failed within `[failed_from, failed_before)`
    /// with the given resend flag.
    pub async fn count_failed_messages_between(
        &self,
        failed_from: DateTime<Utc>,
        failed_before: DateTime<Utc>,
        resend: bool,
    ) -> Result<i64> {
        Ok(self.store.count_failed_between(failed_from, failed_before, resend).await?)
    }

    /// Finds messages that failed within `[failed_from, failed_before)`,
    /// ordered by id ascending.
    pub async fn find_failed_messages(
        &self,
        failed_from: DateTime<Utc>,
        failed_before: DateTime<Utc>,
        resend: bool,
        limit: u32,
    ) -> Result<Vec<FailedMessage>> {
        Ok(self.store.find_failed_between(failed_from, failed_before, resend, limit).await?)
    }

    /// Finds messages with id greater than `after_id` that failed before
    /// `failed_before`, ordered by id ascending. Use for cursor-style
    /// iteration over large failure sets.
    pub async fn find_failed_messages_after(
        &self,
        after_id: i64,
        failed_before: DateTime<Utc>,
        resend: bool,
        limit: u32,
    ) -> Result<Vec<FailedMessage>> {
        Ok(self.store.find_failed_after_id(after_id, failed_before, resend, limit).await?)
    }

    /// Makes the given message available again to the relay for delivery.
    ///
    /// The message re-enters the ready set even though its failure state
    /// remains recorded; the next successful scheduled delivery clears it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MessageNotFound`](outbox_core::StoreError::MessageNotFound)
    /// when no message with that id exists.
    pub async fn resend_message_scheduled(&self, id: i64) -> Result<()> {
        Ok(self.store.mark_for_resend(id, true).await?)
    }
}

impl std::fmt::Debug for TransactionalOutbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalOutbox")
            .field("sender_provider", &self.sender_provider)
            .field("config", &self.config)
            .field("cluster_name", &self.cluster_name)
            .finish_non_exhaustive()
    }
}

/// Builder for [`TransactionalOutbox`].
pub struct OutboxBuilder {
    store: Arc<dyn OutboxStore>,
    sender_provider: Arc<SenderProvider>,
    codec: Arc<dyn MessageCodec>,
    contract_validator: Arc<dyn ContractValidator>,
    tracing: OutboxTracing,
    metrics: Arc<dyn OutboxMetrics>,
    observers: Vec<Arc<dyn SendObserver>>,
    config: OutboxConfig,
    clock: Arc<dyn Clock>,
    cluster_name: Option<String>,
}

impl OutboxBuilder {
    /// Sets the publish-contract validator. Defaults to allowing all.
    pub fn contract_validator(mut self, validator: Arc<dyn ContractValidator>) -> Self {
        self.contract_validator = validator;
        self
    }

    /// Sets the tracing capture/restore collaborators.
    pub fn tracing(mut self, tracing: OutboxTracing) -> Self {
        self.tracing = tracing;
        self
    }

    /// Sets the metrics sink. Defaults to a no-op sink.
    pub fn metrics(mut self, metrics: Arc<dyn OutboxMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Registers a send observer; may be called repeatedly.
    pub fn observer(mut self, observer: Arc<dyn SendObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Sets the engine configuration. Defaults to [`OutboxConfig::default`].
    pub fn config(mut self, config: OutboxConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the clock. Defaults to the real clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the cluster name stamped on every enqueued message.
    pub fn cluster_name(mut self, cluster_name: impl Into<String>) -> Self {
        self.cluster_name = Some(cluster_name.into());
        self
    }

    /// Builds the outbox, validating the configuration.
    pub fn build(self) -> Result<TransactionalOutbox> {
        self.config.validate()?;
        Ok(TransactionalOutbox {
            store: self.store,
            sender_provider: self.sender_provider,
            codec: self.codec,
            contract_validator: self.contract_validator,
            tracing: self.tracing,
            metrics: self.metrics,
            observers: self.observers,
            config: self.config,
            clock: self.clock,
            cluster_name: self.cluster_name,
        })
    }
}

/// An open outbox transaction.
///
/// Accumulates the messages enqueued for immediate delivery and drives the
/// commit hooks: the pre-commit safety delay, the post-commit send attempt
/// and the completion accounting. Dropping the handle without completing it
/// rolls the store transaction back and records the posts with an unknown
/// transaction outcome.
pub struct OutboxTransaction<'a> {
    outbox: &'a TransactionalOutbox,
    tx: Option<Box<dyn StoreTransaction>>,
    accumulated: Vec<DeferredMessage>,
    immediate_count: u64,
    scheduled_count: u64,
    completed: bool,
}

impl OutboxTransaction<'_> {
    /// Enqueues a message for immediate delivery after commit.
    ///
    /// If the immediate send fails, the scheduled relay delivers the
    /// message later after a delay.
    ///
    /// Returns the id of the persisted deferred message.
    pub async fn send(&mut self, message: &dyn OutboxMessage, topic: &str) -> Result<i64> {
        self.enqueue(message, None, topic, true).await
    }

    /// Enqueues a keyed message for immediate delivery after commit.
    pub async fn send_keyed(
        &mut self,
        message: &dyn OutboxMessage,
        key: &dyn MessageKey,
        topic: &str,
    ) -> Result<i64> {
        self.enqueue(message, Some(key), topic, true).await
    }

    /// Enqueues a message for delivery by the scheduled relay.
    pub async fn send_scheduled(
        &mut self,
        message: &dyn OutboxMessage,
        topic: &str,
    ) -> Result<i64> {
        self.enqueue(message, None, topic, false).await
    }

    /// Enqueues a keyed message for delivery by the scheduled relay.
    pub async fn send_scheduled_keyed(
        &mut self,
        message: &dyn OutboxMessage,
        key: &dyn MessageKey,
        topic: &str,
    ) -> Result<i64> {
        self.enqueue(message, Some(key), topic, false).await
    }

    async fn enqueue(
        &mut self,
        message: &dyn OutboxMessage,
        key: Option<&dyn MessageKey>,
        topic: &str,
        send_immediately: bool,
    ) -> Result<i64> {
        let outbox = self.outbox;
        let tx = self.tx.as_mut().ok_or(OutboxError::NoActiveTransaction)?;

        outbox
            .contract_validator
            .ensure_publisher_contract(message.type_name(), topic)
            .map_err(|e| OutboxError::ContractValidationFailed {
                type_name: message.type_name().to_string(),
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        let payload = outbox.codec.serialize_message(message, topic).map_err(|e| {
            OutboxError::SerializationFailed {
                type_name: message.type_name().to_string(),
                message_id: message.message_id().to_string(),
                topic: topic.to_string(),
                reason: e.to_string(),
            }
        })?;
        let serialized_key = match key {
            Some(key) => Some(outbox.codec.serialize_key(key, topic).map_err(|e| {
                OutboxError::KeySerializationFailed {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                }
            })?),
            None => None,
        };

        let new_message = NewDeferredMessage {
            payload,
            key: serialized_key,
            cluster_name: outbox.cluster_name.clone(),
            topic: topic.to_string(),
            message_id: message.message_id().to_string(),
            message_idempotence_id: message.idempotence_id().to_string(),
            message_type_name: message.type_name().to_string(),
            message_type_version: message.type_version().map(str::to_string),
            created_at: outbox.clock.now_utc(),
            send_immediately,
            trace_context: outbox.tracing.capture(),
        };

        let persisted = tx.insert(new_message).await?;

        debug!(
            deferred_message_id = persisted.id,
            topic = %persisted.topic,
            message_id = %persisted.message_id,
            message_type = %persisted.message_type_name,
            send_immediately,
            "persisted deferred message"
        );

        if send_immediately {
            self.accumulated.push(persisted.clone());
            self.immediate_count += 1;
        } else {
            self.scheduled_count += 1;
        }

        for observer in &self.outbox.observers {
            if let Err(observer_error) = observer.on_send(message, topic) {
                warn!(
                    deferred_message_id = persisted.id,
                    topic,
                    error = %observer_error,
                    "send observer failed, continuing"
                );
            }
        }

        Ok(persisted.id)
    }

    /// Number of messages accumulated for immediate delivery.
    pub fn pending_immediate(&self) -> usize {
        self.accumulated.len()
    }

    /// Commits the transaction and attempts immediate delivery.
    ///
    /// Before the store commit, every accumulated message's
    /// `schedule_after` is pushed past the batch's total send budget so the
    /// relay cannot race the post-commit attempt. After a successful
    /// commit, accumulated messages are sent in registration order;
    /// delivery failures are absorbed into message state and never surface
    /// here.
    ///
    /// # Errors
    ///
    /// Returns an error when the pre-commit update or the store commit
    /// itself fails; the transaction is rolled back and nothing is sent.
    pub async fn commit(mut self) -> Result<()> {
        let mut tx = self.tx.take().ok_or(OutboxError::NoActiveTransaction)?;

        let hooks = PostCommitSender::new(self.outbox);
        if let Err(pre_commit_error) =
            hooks.before_commit(&mut tx, &mut self.accumulated).await
        {
            if let Err(rollback_error) = tx.rollback().await {
                warn!(error = %rollback_error, "rollback after failed pre-commit step failed");
            }
            self.complete(TxOutcome::RolledBack);
            return Err(pre_commit_error);
        }

        if let Err(commit_error) = tx.commit().await {
            // The store decides whether a failed commit rolled back; from
            // here the outcome is unknowable.
            self.complete(TxOutcome::Unknown);
            return Err(commit_error.into());
        }

        hooks.after_commit(&self.accumulated).await;
        self.complete(TxOutcome::Committed);
        Ok(())
    }

    /// Rolls the transaction back; nothing will be sent.
    pub async fn rollback(mut self) -> Result<()> {
        let tx = self.tx.take().ok_or(OutboxError::NoActiveTransaction)?;
        let result = tx.rollback().await;
        self.complete(TxOutcome::RolledBack);
        Ok(result?)
    }

    /// Completion step: record the send-intent counts with the transaction
    /// outcome and clear the accumulator.
    fn complete(&mut self, outcome: TxOutcome) {
        if self.completed {
            return;
        }
        self.completed = true;

        if self.immediate_count > 0 {
            self.outbox.metrics.count_posts(
                DeliveryType::Immediate,
                outcome,
                self.immediate_count,
            );
        }
        if self.scheduled_count > 0 {
            self.outbox.metrics.count_posts(
                DeliveryType::Scheduled,
                outcome,
                self.scheduled_count,
            );
        }
        self.accumulated.clear();
    }
}

impl Drop for OutboxTransaction<'_> {
    fn drop(&mut self) {
        // An abandoned handle rolls the store transaction back implicitly;
        // the final transaction state is unknown from here.
        self.complete(TxOutcome::Unknown);
    }
}

impl std::fmt::Debug for OutboxTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxTransaction")
            .field("active", &self.tx.is_some())
            .field("pending_immediate", &self.accumulated.len())
            .field("immediate_count", &self.immediate_count)
            .field("scheduled_count", &self.scheduled_count)
            .finish()
    }
}
