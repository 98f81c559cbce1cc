//! Test messages, codec and contract validator.
//!
//! [`TestMessage`] is a plain string-bodied domain message; [`TestCodec`]
//! serializes it by downcasting, the way a real codec would dispatch on
//! its known message types. Both can be scripted to fail for testing the
//! enqueue error paths.

use std::{
    any::Any,
    collections::HashSet,
    sync::Mutex,
};

use outbox_engine::{
    CollaboratorError, ContractValidator, MessageCodec, MessageKey, OutboxMessage,
};
use uuid::Uuid;

/// A simple domain message for tests.
#[derive(Debug, Clone)]
pub struct TestMessage {
    /// Domain message id.
    pub message_id: String,
    /// Domain idempotence id.
    pub idempotence_id: String,
    /// Message type name.
    pub type_name: String,
    /// Message type version.
    pub type_version: Option<String>,
    /// Body serialized by [`TestCodec`].
    pub body: String,
    /// Makes [`TestCodec`] reject this message.
    pub fail_serialization: bool,
}

impl TestMessage {
    /// Creates a message with random identity and the given body.
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            idempotence_id: Uuid::new_v4().to_string(),
            type_name: "TestEvent".to_string(),
            type_version: Some("1.0.0".to_string()),
            body: body.into(),
            fail_serialization: false,
        }
    }

    /// Sets the type name.
    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = type_name.into();
        self
    }

    /// Makes serialization of this message fail.
    pub fn with_failing_serialization(mut self) -> Self {
        self.fail_serialization = true;
        self
    }
}

impl OutboxMessage for TestMessage {
    fn message_id(&self) -> &str {
        &self.message_id
    }

    fn idempotence_id(&self) -> &str {
        &self.idempotence_id
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn type_version(&self) -> Option<&str> {
        self.type_version.as_deref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A simple routing key for tests.
#[derive(Debug, Clone)]
pub struct TestKey {
    /// Key value serialized by [`TestCodec`].
    pub value: String,
    /// Makes [`TestCodec`] reject this key.
    pub fail_serialization: bool,
}

impl TestKey {
    /// Creates a key with the given value.
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into(), fail_serialization: false }
    }

    /// Makes serialization of this key fail.
    pub fn with_failing_serialization(mut self) -> Self {
        self.fail_serialization = true;
        self
    }
}

impl MessageKey for TestKey {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Codec serializing [`TestMessage`] bodies and [`TestKey`] values as
/// UTF-8 bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestCodec;

impl MessageCodec for TestCodec {
    fn serialize_message(
        &self,
        message: &dyn OutboxMessage,
        topic: &str,
    ) -> Result<Vec<u8>, CollaboratorError> {
        let message = message
            .as_any()
            .downcast_ref::<TestMessage>()
            .ok_or_else(|| format!("unsupported message type for topic '{topic}'"))?;
        if message.fail_serialization {
            return Err(format!("scripted serialization failure for topic '{topic}'").into());
        }
        Ok(message.body.clone().into_bytes())
    }

    fn serialize_key(&self, key: &dyn MessageKey, topic: &str) -> Result<Vec<u8>, CollaboratorError> {
        let key = key
            .as_any()
            .downcast_ref::<TestKey>()
            .ok_or_else(|| format!("unsupported key type for topic '{topic}'"))?;
        if key.fail_serialization {
            return Err(format!("scripted key serialization failure for topic '{topic}'").into());
        }
        Ok(key.value.clone().into_bytes())
    }
}

/// Contract validator with a configurable deny list.
///
/// Allows everything by default; denied topics reject every message type.
#[derive(Debug, Default)]
pub struct TestContractValidator {
    denied_topics: Mutex<HashSet<String>>,
}

impl TestContractValidator {
    /// Creates a validator that allows everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Denies publishing on the given topic.
    pub fn deny_topic(&self, topic: impl Into<String>) {
        self.denied_topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(topic.into());
    }
}

impl ContractValidator for TestContractValidator {
    fn ensure_publisher_contract(
        &self,
        type_name: &str,
        topic: &str,
    ) -> Result<(), CollaboratorError> {
        let denied = self
            .denied_topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(topic);
        if denied {
            return Err(
                format!("no publisher contract for type '{type_name}' on topic '{topic}'").into()
            );
        }
        Ok(())
    }
}
