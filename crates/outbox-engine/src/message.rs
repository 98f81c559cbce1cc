//! Message identity and enqueue-time collaborator contracts.
//!
//! The outbox treats domain messages as opaque: it records their identity
//! metadata and hands the value to the codec for serialization. The codec,
//! the publish-contract validator and the send observers are collaborator
//! seams implemented outside this crate.

use std::any::Any;

/// Failure type of the collaborator contracts.
///
/// Collaborators surface whatever error type they use; the engine only
/// needs the description.
pub type CollaboratorError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A domain message that can be enqueued.
///
/// The identity accessors populate the message metadata columns; the
/// payload itself is produced by the [`MessageCodec`]. `as_any` lets codec
/// implementations downcast to the concrete message type.
pub trait OutboxMessage: Send + Sync {
    /// Domain message id.
    fn message_id(&self) -> &str;

    /// Domain idempotence id.
    fn idempotence_id(&self) -> &str;

    /// Name of the message type.
    fn type_name(&self) -> &str;

    /// Version of the message type, if the type is versioned.
    fn type_version(&self) -> Option<&str> {
        None
    }

    /// The message as [`Any`] for codec downcasts.
    fn as_any(&self) -> &dyn Any;
}

/// A routing key that can be enqueued alongside a message.
pub trait MessageKey: Send + Sync {
    /// The key as [`Any`] for codec downcasts.
    fn as_any(&self) -> &dyn Any;
}

/// Serializes messages and keys into transport payload bytes.
///
/// Both operations may fail; a failure aborts the enqueue call before
/// anything is persisted.
pub trait MessageCodec: Send + Sync {
    /// Serializes the message for the given topic.
    fn serialize_message(
        &self,
        message: &dyn OutboxMessage,
        topic: &str,
    ) -> Result<Vec<u8>, CollaboratorError>;

    /// Serializes the key for the given topic.
    fn serialize_key(
        &self,
        key: &dyn MessageKey,
        topic: &str,
    ) -> Result<Vec<u8>, CollaboratorError>;
}

/// Validates that the message type may be published on the topic.
pub trait ContractValidator: Send + Sync {
    /// Checks the publisher contract; an error aborts the enqueue call
    /// before anything is persisted.
    fn ensure_publisher_contract(
        &self,
        type_name: &str,
        topic: &str,
    ) -> Result<(), CollaboratorError>;
}

/// Observer invoked synchronously for every enqueued message.
///
/// Observational only: observer failures are logged and isolated per
/// observer, they never affect outbox state or the caller's transaction.
pub trait SendObserver: Send + Sync {
    /// Called after the message was persisted in the caller's transaction.
    fn on_send(&self, message: &dyn OutboxMessage, topic: &str) -> Result<(), CollaboratorError>;
}

/// A contract validator that accepts every message type on every topic.
///
/// For deployments that check publish contracts elsewhere or not at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllContracts;

impl ContractValidator for AllowAllContracts {
    fn ensure_publisher_contract(
        &self,
        _type_name: &str,
        _topic: &str,
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }
}
