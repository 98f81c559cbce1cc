//! Error types for the outbox engine.
//!
//! Enqueue-time errors propagate synchronously to the caller and abort the
//! enclosing transaction's outbox writes. Delivery-time errors never reach
//! the original caller; they are resolved into persistent state or deferred
//! to a later attempt.

use outbox_core::{SendFailureReason, StoreError};
use thiserror::Error;

/// Result type alias using [`OutboxError`].
pub type Result<T> = std::result::Result<T, OutboxError>;

/// Errors surfaced by the enqueue API and the engine's store interactions.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// The outbox transaction handle has already completed.
    ///
    /// Messages can only be enqueued while the transaction that carries
    /// them is still open.
    #[error("no active transaction: the outbox transaction has already completed")]
    NoActiveTransaction,

    /// The publish contract validation rejected the message type for the
    /// topic. Nothing was persisted.
    #[error(
        "contract validation for message type '{type_name}' on topic '{topic}' failed: {reason}"
    )]
    ContractValidationFailed {
        /// Domain message type name.
        type_name: String,
        /// Destination topic.
        topic: String,
        /// Validator failure description.
        reason: String,
    },

    /// Message serialization failed. Nothing was persisted.
    #[error(
        "serialization of message with type '{type_name}' and id '{message_id}' for topic \
         '{topic}' failed: {reason}"
    )]
    SerializationFailed {
        /// Domain message type name.
        type_name: String,
        /// Domain message id.
        message_id: String,
        /// Destination topic.
        topic: String,
        /// Codec failure description.
        reason: String,
    },

    /// Key serialization failed. Nothing was persisted.
    #[error("serialization of key for topic '{topic}' failed: {reason}")]
    KeySerializationFailed {
        /// Destination topic.
        topic: String,
        /// Codec failure description.
        reason: String,
    },

    /// A sender provider was constructed without a sender for the default
    /// producer cluster.
    #[error("no message sender registered for the default producer cluster '{cluster_name}'")]
    MissingDefaultClusterSender {
        /// The default producer cluster name.
        cluster_name: String,
    },

    /// Invalid configuration value.
    #[error("invalid outbox configuration: {0}")]
    Configuration(String),

    /// Store operation failed, including the
    /// [`MessageNotFound`](StoreError::MessageNotFound) integrity violation.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A transport send failure carrying its classification.
///
/// The reason is the sole driver of the delivery branching: message-caused
/// reasons are absorbed into the state machine as `failed_at`, everything
/// else aborts the current delivery batch and defers to a later attempt.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SendError {
    reason: SendFailureReason,
    message: String,
}

impl SendError {
    /// Creates a send error with an explicit reason.
    pub fn new(reason: SendFailureReason, message: impl Into<String>) -> Self {
        Self { reason, message: message.into() }
    }

    /// The target topic does not exist or its name is illegal.
    pub fn invalid_topic(topic: &str) -> Self {
        Self::new(SendFailureReason::InvalidTopic, format!("illegal topic '{topic}'"))
    }

    /// The producer is not authorized on the target topic.
    pub fn unauthorized_on_topic(topic: &str) -> Self {
        Self::new(SendFailureReason::UnauthorizedOnTopic, format!("unauthorized on topic '{topic}'"))
    }

    /// The serialized message exceeds the transport's size limit.
    pub fn message_too_large(topic: &str) -> Self {
        Self::new(SendFailureReason::MessageTooLarge, format!("message too large for topic '{topic}'"))
    }

    /// Generic infrastructure failure.
    pub fn general(message: impl Into<String>) -> Self {
        Self::new(SendFailureReason::General, message)
    }

    /// The send did not complete within the configured timeout.
    ///
    /// Timeouts are infrastructure failures: the in-flight attempt may
    /// still complete, so the message is never marked failed for one.
    pub fn timed_out(topic: &str, timeout: std::time::Duration) -> Self {
        Self::new(
            SendFailureReason::General,
            format!("sending message to topic '{topic}' timed out after {timeout:?}"),
        )
    }

    /// No cluster with the given name is configured on the sender side.
    pub fn unknown_cluster(cluster_name: &str) -> Self {
        Self::new(
            SendFailureReason::General,
            format!("no message transport cluster named '{cluster_name}' is configured"),
        )
    }

    /// The failure classification.
    pub fn reason(&self) -> SendFailureReason {
        self.reason
    }

    /// Whether the failure is attributable to the message itself.
    pub fn caused_by_message(&self) -> bool {
        self.reason.caused_by_message()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_error_classification_follows_reason() {
        assert!(SendError::invalid_topic("t").caused_by_message());
        assert!(SendError::unauthorized_on_topic("t").caused_by_message());
        assert!(SendError::message_too_large("t").caused_by_message());
        assert!(!SendError::general("broker unreachable").caused_by_message());
        assert!(!SendError::timed_out("t", std::time::Duration::from_secs(15)).caused_by_message());
        assert!(!SendError::unknown_cluster("aws-east").caused_by_message());
    }

    #[test]
    fn store_errors_convert_transparently() {
        let err: OutboxError = StoreError::MessageNotFound(7).into();
        assert!(matches!(err, OutboxError::Store(StoreError::MessageNotFound(7))));
    }
}
