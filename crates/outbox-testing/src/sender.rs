//! Scripted mock sender.
//!
//! Records every transmission and plays back scripted outcomes so tests
//! can drive the failure branches of the post-commit sender and the relay
//! deterministically. Optional per-send latency advances the shared test
//! clock, simulating slow transports without real waiting.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use outbox_core::{storage::BoxFuture, DeferredMessage, TestClock};
use outbox_engine::{DeliveryType, MessageSender, SendError};

/// Scripted outcome of one send attempt.
#[derive(Debug, Clone)]
pub enum SendScript {
    /// The send succeeds.
    Succeed,
    /// The send fails with the given error.
    Fail(SendError),
    /// The send never completes; use with a short configured timeout to
    /// exercise the timeout path.
    Hang,
}

/// Record of one successful transmission.
#[derive(Debug, Clone)]
pub struct SentRecord {
    /// Deferred message id.
    pub deferred_message_id: i64,
    /// Domain message id.
    pub message_id: String,
    /// Destination topic.
    pub topic: String,
    /// Which delivery path transmitted the message.
    pub delivery: DeliveryType,
}

#[derive(Default)]
struct Script {
    /// Outcomes consumed by any send, in order.
    next: VecDeque<SendScript>,
    /// Outcomes consumed by sends of a specific domain message id.
    per_message: HashMap<String, VecDeque<SendScript>>,
}

/// Mock transport sender.
#[derive(Default)]
pub struct MockSender {
    clock: Option<TestClock>,
    latency: Mutex<Duration>,
    script: Mutex<Script>,
    sent: Mutex<Vec<SentRecord>>,
}

impl MockSender {
    /// Creates a sender that always succeeds instantly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sender whose latency advances the given test clock.
    pub fn with_clock(clock: TestClock) -> Self {
        Self { clock: Some(clock), ..Self::default() }
    }

    /// Sets the simulated duration of every send.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = latency;
    }

    /// Scripts the outcome of the next send, regardless of message.
    ///
    /// Repeated calls queue outcomes in order; once the queue is drained
    /// sends succeed again.
    pub fn script_next(&self, outcome: SendScript) {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .next
            .push_back(outcome);
    }

    /// Scripts the outcome of the next send of the given domain message id.
    ///
    /// Per-message scripts take precedence over [`script_next`](Self::script_next).
    pub fn script_message(&self, message_id: impl Into<String>, outcome: SendScript) {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .per_message
            .entry(message_id.into())
            .or_default()
            .push_back(outcome);
    }

    /// All successful transmissions in order.
    pub fn sent(&self) -> Vec<SentRecord> {
        self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Number of successful transmissions.
    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    fn next_outcome(&self, message: &DeferredMessage) -> SendScript {
        let mut script = self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(queue) = script.per_message.get_mut(&message.message_id) {
            if let Some(outcome) = queue.pop_front() {
                return outcome;
            }
        }
        script.next.pop_front().unwrap_or(SendScript::Succeed)
    }

    async fn send(
        &self,
        message: &DeferredMessage,
        delivery: DeliveryType,
    ) -> Result<(), SendError> {
        let latency = *self.latency.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !latency.is_zero() {
            if let Some(clock) = &self.clock {
                clock.advance(latency);
            }
        }

        match self.next_outcome(message) {
            SendScript::Succeed => {
                self.sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(
                    SentRecord {
                        deferred_message_id: message.id,
                        message_id: message.message_id.clone(),
                        topic: message.topic.clone(),
                        delivery,
                    },
                );
                Ok(())
            },
            SendScript::Fail(error) => Err(error),
            SendScript::Hang => {
                std::future::pending::<()>().await;
                unreachable!("pending future never resolves")
            },
        }
    }
}

impl MessageSender for MockSender {
    fn send_immediate<'a>(
        &'a self,
        message: &'a DeferredMessage,
    ) -> BoxFuture<'a, Result<(), SendError>> {
        Box::pin(self.send(message, DeliveryType::Immediate))
    }

    fn send_scheduled<'a>(
        &'a self,
        message: &'a DeferredMessage,
    ) -> BoxFuture<'a, Result<(), SendError>> {
        Box::pin(self.send(message, DeliveryType::Scheduled))
    }
}

impl std::fmt::Debug for MockSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSender").field("sent_count", &self.sent_count()).finish()
    }
}
