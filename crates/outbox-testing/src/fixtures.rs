//! Builders for seeding outbox rows in specific lifecycle states.
//!
//! Housekeeping and relay tests need rows that are already sent, failed or
//! aged; the builder writes them directly to the store, bypassing the
//! enqueue path.

use chrono::{DateTime, Utc};
use outbox_core::{DeferredMessage, MemoryOutboxStore, SendFailureReason};
use uuid::Uuid;

/// Builder for a [`DeferredMessage`] row in an arbitrary lifecycle state.
#[derive(Debug, Clone)]
pub struct DeferredMessageBuilder {
    message: DeferredMessage,
}

impl DeferredMessageBuilder {
    /// Creates a builder for an unsent scheduled-delivery row created at
    /// the given time.
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            message: DeferredMessage {
                id: 0,
                payload: b"payload".to_vec(),
                key: None,
                cluster_name: None,
                topic: "test-topic".to_string(),
                message_id: Uuid::new_v4().to_string(),
                message_idempotence_id: Uuid::new_v4().to_string(),
                message_type_name: "TestEvent".to_string(),
                message_type_version: Some("1.0.0".to_string()),
                created_at,
                send_immediately: false,
                schedule_after: None,
                sent_immediately_at: None,
                sent_scheduled_at: None,
                failed_at: None,
                fail_reason: None,
                resend: false,
                trace_context: None,
            },
        }
    }

    /// Sets the destination topic.
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.message.topic = topic.into();
        self
    }

    /// Sets the domain message id.
    pub fn message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message.message_id = message_id.into();
        self
    }

    /// Sets the target cluster name.
    pub fn cluster_name(mut self, cluster_name: impl Into<String>) -> Self {
        self.message.cluster_name = Some(cluster_name.into());
        self
    }

    /// Marks the row for immediate delivery with the given safety delay.
    pub fn send_immediately(mut self, schedule_after: DateTime<Utc>) -> Self {
        self.message.send_immediately = true;
        self.message.schedule_after = Some(schedule_after);
        self
    }

    /// Marks the row as sent by the post-commit sender.
    pub fn sent_immediately_at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.message.sent_immediately_at = Some(sent_at);
        self
    }

    /// Marks the row as sent by the relay.
    pub fn sent_scheduled_at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.message.sent_scheduled_at = Some(sent_at);
        self
    }

    /// Marks the row as permanently failed.
    pub fn failed(mut self, failed_at: DateTime<Utc>, reason: SendFailureReason) -> Self {
        self.message.failed_at = Some(failed_at);
        self.message.fail_reason = Some(reason);
        self
    }

    /// Marks the row for resend.
    pub fn resend(mut self) -> Self {
        self.message.resend = true;
        self
    }

    /// Returns the built row with a zero id.
    pub fn build(self) -> DeferredMessage {
        self.message
    }

    /// Writes the row into the store, returning the assigned id.
    pub async fn seed(self, store: &MemoryOutboxStore) -> i64 {
        store.seed(self.message).await
    }
}
