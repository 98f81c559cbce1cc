//! Relay semantics: ordering, failure branching, the run deadline and the
//! resend cycle.

use std::time::Duration;

use anyhow::Result;
use outbox_core::{Clock, SendFailureReason};
use outbox_engine::{OutboxConfig, SendError};
use outbox_testing::{
    assert_store_invariants, init_test_tracing, DeferredMessageBuilder, OutboxTestEnv,
    SendScript, TestMessage,
};

#[tokio::test]
async fn relay_delivers_ready_messages_in_id_order() -> Result<()> {
    init_test_tracing();
    let env = OutboxTestEnv::new();

    let ids = env.enqueue_scheduled(3, "orders").await?;
    let summary = env.relay().relay().await?;

    assert_eq!(summary.sent, 3);
    assert!(!summary.aborted);
    assert!(!summary.deadline_reached);

    let sent = env.sender.sent();
    let sent_ids: Vec<i64> = sent.iter().map(|record| record.deferred_message_id).collect();
    assert_eq!(sent_ids, ids);

    for id in ids {
        let row = env.message(id).await;
        assert!(row.sent_scheduled_at.is_some());
        assert!(row.sent_immediately_at.is_none());
    }
    assert_store_invariants(&env.store).await;
    Ok(())
}

#[tokio::test]
async fn second_run_finds_nothing_to_do() -> Result<()> {
    let env = OutboxTestEnv::new();
    env.enqueue_scheduled(2, "orders").await?;

    env.relay().relay().await?;
    let summary = env.relay().relay().await?;

    assert_eq!(summary.sent, 0);
    assert_eq!(env.sender.sent_count(), 2);
    Ok(())
}

#[tokio::test]
async fn message_caused_failure_marks_failed_and_continues() -> Result<()> {
    let env = OutboxTestEnv::new();

    let poison = TestMessage::new("poison");
    env.sender.script_message(
        poison.message_id.clone(),
        SendScript::Fail(SendError::message_too_large("orders")),
    );

    let mut tx = env.outbox.transaction().await?;
    let id_first = tx.send_scheduled(&TestMessage::new("first"), "orders").await?;
    let id_poison = tx.send_scheduled(&poison, "orders").await?;
    let id_last = tx.send_scheduled(&TestMessage::new("last"), "orders").await?;
    tx.commit().await?;

    let summary = env.relay().relay().await?;
    assert_eq!(summary.sent, 2);
    assert_eq!(summary.failed, 1);
    assert!(!summary.aborted);

    let poison_row = env.message(id_poison).await;
    assert!(poison_row.failed_at.is_some());
    assert_eq!(poison_row.fail_reason, Some(SendFailureReason::MessageTooLarge));
    assert!(env.message(id_first).await.sent_scheduled_at.is_some());
    assert!(env.message(id_last).await.sent_scheduled_at.is_some());

    // The failed message is out of the ready set; nothing left to do.
    let summary = env.relay().relay().await?;
    assert_eq!(summary.sent, 0);
    assert_eq!(summary.failed, 0);

    assert_store_invariants(&env.store).await;
    Ok(())
}

#[tokio::test]
async fn infrastructure_failure_aborts_run_leaving_rest_untouched() -> Result<()> {
    let env = OutboxTestEnv::new();

    let flaky = TestMessage::new("flaky");
    env.sender.script_message(
        flaky.message_id.clone(),
        SendScript::Fail(SendError::general("send timeout")),
    );

    let mut tx = env.outbox.transaction().await?;
    let id_first = tx.send_scheduled(&TestMessage::new("first"), "orders").await?;
    let id_flaky = tx.send_scheduled(&flaky, "orders").await?;
    let id_last = tx.send_scheduled(&TestMessage::new("last"), "orders").await?;
    tx.commit().await?;

    let summary = env.relay().relay().await?;
    assert!(summary.aborted);
    assert_eq!(summary.sent, 1);

    // The flaky message is not failed and the one after it was never
    // attempted.
    let flaky_row = env.message(id_flaky).await;
    assert!(flaky_row.failed_at.is_none());
    assert!(flaky_row.sent_scheduled_at.is_none());
    assert!(env.message(id_last).await.sent_scheduled_at.is_none());
    assert!(env.message(id_first).await.sent_scheduled_at.is_some());

    // The next run retries both; the script is drained, so they succeed.
    let summary = env.relay().relay().await?;
    assert_eq!(summary.sent, 2);
    assert!(!summary.aborted);
    Ok(())
}

#[tokio::test]
async fn deadline_bounds_one_run_and_the_next_run_continues() -> Result<()> {
    let config = OutboxConfig {
        relay_batch_size: 2,
        continuous_relay_timeout: Duration::from_secs(3),
        ..OutboxConfig::default()
    };
    let env = OutboxTestEnv::with_config(config);
    env.sender.set_latency(Duration::from_millis(500));

    env.enqueue_scheduled(8, "orders").await?;

    // Each batch of 2 takes one simulated second; only three full batches
    // fit before the 3 s deadline.
    let summary = env.relay().relay().await?;
    assert_eq!(summary.sent, 6);
    assert!(summary.deadline_reached);

    let summary = env.relay().relay().await?;
    assert_eq!(summary.sent, 2);
    assert!(!summary.deadline_reached);
    assert_eq!(env.sender.sent_count(), 8);
    Ok(())
}

#[tokio::test]
async fn failed_message_is_skipped_until_marked_for_resend() -> Result<()> {
    let env = OutboxTestEnv::new();
    let now = env.clock.now_utc();

    let failed_id = DeferredMessageBuilder::new(now)
        .topic("orders")
        .failed(now, SendFailureReason::UnauthorizedOnTopic)
        .seed(&env.store)
        .await;

    // Not ready: the relay never retries failed messages on its own.
    let summary = env.relay().relay().await?;
    assert_eq!(summary.sent, 0);

    env.outbox.resend_message_scheduled(failed_id).await?;

    // Marked for resend it re-enters the ready set even though the
    // failure state is still recorded.
    let row = env.message(failed_id).await;
    assert!(row.resend);
    assert!(row.failed_at.is_some());
    assert!(row.is_ready(env.clock.now_utc()));

    let summary = env.relay().relay().await?;
    assert_eq!(summary.sent, 1);

    // Successful delivery clears the failure state and the resend flag.
    let row = env.message(failed_id).await;
    assert!(row.sent_scheduled_at.is_some());
    assert!(row.failed_at.is_none());
    assert!(row.fail_reason.is_none());
    assert!(!row.resend);

    assert_store_invariants(&env.store).await;
    Ok(())
}

#[tokio::test]
async fn resend_survives_another_failed_attempt_only_if_requested_again() -> Result<()> {
    let env = OutboxTestEnv::new();
    let now = env.clock.now_utc();

    let failed_id = DeferredMessageBuilder::new(now)
        .topic("orders")
        .message_id("resend-me")
        .failed(now, SendFailureReason::InvalidTopic)
        .seed(&env.store)
        .await;
    env.outbox.resend_message_scheduled(failed_id).await?;
    env.sender
        .script_message("resend-me", SendScript::Fail(SendError::invalid_topic("orders")));

    let summary = env.relay().relay().await?;
    assert_eq!(summary.failed, 1);

    // The failed resend attempt cleared the resend flag again.
    let row = env.message(failed_id).await;
    assert!(!row.resend);
    assert!(row.failed_at.is_some());
    assert!(!row.is_ready(env.clock.now_utc()));
    Ok(())
}

#[tokio::test]
async fn immediate_messages_become_ready_only_after_their_safety_delay() -> Result<()> {
    let env = OutboxTestEnv::new();
    let now = env.clock.now_utc();

    DeferredMessageBuilder::new(now)
        .topic("orders")
        .send_immediately(now + chrono::Duration::seconds(20))
        .seed(&env.store)
        .await;

    assert_eq!(env.relay().relay().await?.sent, 0);

    env.clock.advance(Duration::from_secs(21));
    assert_eq!(env.relay().relay().await?.sent, 1);
    Ok(())
}

#[tokio::test]
async fn ready_lag_gauge_reflects_store_state() -> Result<()> {
    use outbox_engine::MetricsUpdateScheduler;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    let env = OutboxTestEnv::new();
    env.enqueue_scheduled(3, "orders").await?;
    let now = env.clock.now_utc();
    DeferredMessageBuilder::new(now)
        .failed(now, SendFailureReason::General)
        .seed(&env.store)
        .await;
    DeferredMessageBuilder::new(now)
        .failed(now, SendFailureReason::InvalidTopic)
        .resend()
        .seed(&env.store)
        .await;

    let updater = MetricsUpdateScheduler::new(
        env.store.clone(),
        env.metrics.clone(),
        env.config.clone(),
        CancellationToken::new(),
    )
    .with_clock(Arc::new(env.clock.clone()));
    updater.update_once().await?;

    let snapshot = env.metrics.snapshot();
    // 3 scheduled plus the resend-flagged failure are ready.
    assert_eq!(snapshot.ready_to_be_sent, 4);
    assert_eq!(snapshot.failed_resend_disabled, 1);
    assert_eq!(snapshot.failed_resend_enabled, 1);
    Ok(())
}
