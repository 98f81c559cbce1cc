//! Ready-wired outbox test environment.

use std::sync::Arc;

use anyhow::Result;
use outbox_core::{DeferredMessage, MemoryOutboxStore, OutboxStore, TestClock};
use outbox_engine::{
    AtomicOutboxMetrics, Housekeeping, MessageRelay, OutboxConfig, SenderProvider,
    TransactionalOutbox,
};

use crate::{
    codec::{TestCodec, TestContractValidator, TestMessage},
    sender::MockSender,
};

/// Cluster name the test environment registers its sender under.
pub const TEST_CLUSTER: &str = "default-producer";

/// A complete outbox wired against the in-memory store, the mock sender
/// and a test clock.
///
/// Every component shares the same clock, so advancing it moves the relay
/// deadline, the retention cutoffs and the safety delays together.
pub struct OutboxTestEnv {
    /// Shared deterministic clock.
    pub clock: TestClock,
    /// The in-memory store backing the outbox.
    pub store: Arc<MemoryOutboxStore>,
    /// The scripted transport sender.
    pub sender: Arc<MockSender>,
    /// The contract validator with a configurable deny list.
    pub validator: Arc<TestContractValidator>,
    /// In-process metrics sink.
    pub metrics: Arc<AtomicOutboxMetrics>,
    /// The outbox under test.
    pub outbox: TransactionalOutbox,
    /// The configuration the environment was built with.
    pub config: OutboxConfig,
}

impl OutboxTestEnv {
    /// Creates an environment with the default configuration.
    pub fn new() -> Self {
        Self::with_config(OutboxConfig::default())
    }

    /// Creates an environment with the given configuration.
    ///
    /// # Panics
    ///
    /// Panics when the configuration is invalid; test configurations are
    /// authored inline.
    pub fn with_config(config: OutboxConfig) -> Self {
        let clock = TestClock::new();
        let store = Arc::new(MemoryOutboxStore::new());
        let sender = Arc::new(MockSender::with_clock(clock.clone()));
        let validator = Arc::new(TestContractValidator::new());
        let metrics = Arc::new(AtomicOutboxMetrics::new());

        let provider =
            Arc::new(SenderProvider::single(TEST_CLUSTER, sender.clone()));
        let outbox = TransactionalOutbox::builder(store.clone(), provider, Arc::new(TestCodec))
            .contract_validator(validator.clone())
            .metrics(metrics.clone())
            .config(config.clone())
            .clock(Arc::new(clock.clone()))
            .cluster_name(TEST_CLUSTER)
            .build()
            .expect("test configuration must be valid");

        Self { clock, store, sender, validator, metrics, outbox, config }
    }

    /// Builds a relay over the environment's store, sender and clock.
    pub fn relay(&self) -> MessageRelay {
        MessageRelay::new(
            self.store.clone(),
            Arc::new(SenderProvider::single(TEST_CLUSTER, self.sender.clone())),
            self.config.clone(),
        )
        .with_metrics(self.metrics.clone())
        .with_clock(Arc::new(self.clock.clone()))
    }

    /// Builds a housekeeping job over the environment's store and clock.
    pub fn housekeeping(&self) -> Housekeeping {
        Housekeeping::new(self.store.clone(), self.config.clone())
            .with_clock(Arc::new(self.clock.clone()))
    }

    /// Enqueues `count` scheduled-delivery messages in one committed
    /// transaction, returning their ids.
    pub async fn enqueue_scheduled(&self, count: usize, topic: &str) -> Result<Vec<i64>> {
        let mut tx = self.outbox.transaction().await?;
        let mut ids = Vec::with_capacity(count);
        for index in 0..count {
            let message = TestMessage::new(format!("scheduled message {index}"));
            ids.push(tx.send_scheduled(&message, topic).await?);
        }
        tx.commit().await?;
        Ok(ids)
    }

    /// Enqueues `count` immediate-delivery messages in one committed
    /// transaction, returning their ids.
    pub async fn enqueue_immediate(&self, count: usize, topic: &str) -> Result<Vec<i64>> {
        let mut tx = self.outbox.transaction().await?;
        let mut ids = Vec::with_capacity(count);
        for index in 0..count {
            let message = TestMessage::new(format!("immediate message {index}"));
            ids.push(tx.send(&message, topic).await?);
        }
        tx.commit().await?;
        Ok(ids)
    }

    /// Fetches a message that must exist.
    ///
    /// # Panics
    ///
    /// Panics when the message does not exist; test rows are seeded by the
    /// test itself.
    pub async fn message(&self, id: i64) -> DeferredMessage {
        self.store
            .get(id)
            .await
            .expect("in-memory store get cannot fail")
            .unwrap_or_else(|| panic!("expected deferred message {id} to exist"))
    }
}

impl Default for OutboxTestEnv {
    fn default() -> Self {
        Self::new()
    }
}
