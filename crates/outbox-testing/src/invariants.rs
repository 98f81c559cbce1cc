//! Invariant checks over outbox state.
//!
//! Run after any sequence of operations: the invariants hold in every
//! reachable state, not just at rest.

use outbox_core::{DeferredMessage, MemoryOutboxStore};

/// Checks the state invariants of a single row.
///
/// - At most one of the sent timestamps is set.
/// - `fail_reason` is set iff `failed_at` is set.
///
/// Returns a description of the first violated invariant.
pub fn check_message_invariants(message: &DeferredMessage) -> Result<(), String> {
    if message.sent_immediately_at.is_some() && message.sent_scheduled_at.is_some() {
        return Err(format!(
            "message {} has both sent_immediately_at and sent_scheduled_at set",
            message.id
        ));
    }
    if message.failed_at.is_some() != message.fail_reason.is_some() {
        return Err(format!(
            "message {} has inconsistent failure state: failed_at={:?}, fail_reason={:?}",
            message.id, message.failed_at, message.fail_reason
        ));
    }
    Ok(())
}

/// Asserts the state invariants over every row in the store.
///
/// # Panics
///
/// Panics with the first violated invariant.
pub async fn assert_store_invariants(store: &MemoryOutboxStore) {
    for message in store.snapshot().await {
        if let Err(violation) = check_message_invariants(&message) {
            panic!("outbox invariant violated: {violation}");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use outbox_core::SendFailureReason;

    use super::*;
    use crate::fixtures::DeferredMessageBuilder;

    #[test]
    fn both_sent_timestamps_violate_invariants() {
        let now = Utc::now();
        let message = DeferredMessageBuilder::new(now)
            .sent_immediately_at(now)
            .sent_scheduled_at(now)
            .build();
        assert!(check_message_invariants(&message).is_err());
    }

    #[test]
    fn failure_state_must_be_consistent() {
        let now = Utc::now();
        let mut message = DeferredMessageBuilder::new(now).build();
        message.failed_at = Some(now);
        assert!(check_message_invariants(&message).is_err());

        message.fail_reason = Some(SendFailureReason::General);
        assert!(check_message_invariants(&message).is_ok());
    }

    #[tokio::test]
    async fn store_invariants_pass_on_seeded_states() {
        let store = MemoryOutboxStore::new();
        let now = Utc::now();
        DeferredMessageBuilder::new(now).seed(&store).await;
        DeferredMessageBuilder::new(now).sent_scheduled_at(now).seed(&store).await;
        DeferredMessageBuilder::new(now)
            .failed(now, SendFailureReason::InvalidTopic)
            .resend()
            .seed(&store)
            .await;

        assert_store_invariants(&store).await;
    }
}
