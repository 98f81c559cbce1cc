//! Housekeeping semantics: retention cutoffs, sweep independence,
//! pagination and the page cap.

use std::time::Duration;

use anyhow::Result;
use outbox_core::{Clock, OutboxStore, SendFailureReason};
use outbox_engine::OutboxConfig;
use outbox_testing::{init_test_tracing, DeferredMessageBuilder, OutboxTestEnv};

fn retention_config() -> OutboxConfig {
    OutboxConfig {
        sent_retention: Duration::from_secs(2 * 24 * 60 * 60),
        unsent_retention: Duration::from_secs(30 * 24 * 60 * 60),
        ..OutboxConfig::default()
    }
}

#[tokio::test]
async fn sweep_deletes_only_sent_rows_past_retention() -> Result<()> {
    init_test_tracing();
    let env = OutboxTestEnv::with_config(retention_config());
    let now = env.clock.now_utc();

    let old_sent_immediately = DeferredMessageBuilder::new(now - chrono::Duration::days(5))
        .sent_immediately_at(now - chrono::Duration::days(3))
        .seed(&env.store)
        .await;
    let old_sent_scheduled = DeferredMessageBuilder::new(now - chrono::Duration::days(5))
        .sent_scheduled_at(now - chrono::Duration::days(3))
        .seed(&env.store)
        .await;
    let fresh_sent = DeferredMessageBuilder::new(now - chrono::Duration::hours(30))
        .sent_scheduled_at(now - chrono::Duration::hours(12))
        .seed(&env.store)
        .await;
    let unsent = DeferredMessageBuilder::new(now - chrono::Duration::days(5))
        .seed(&env.store)
        .await;

    let summary = env.housekeeping().delete_old_messages().await?;
    assert_eq!(summary.deleted_sent, 2);
    assert_eq!(summary.deleted_unsent, 0);

    assert!(env.store.get(old_sent_immediately).await?.is_none());
    assert!(env.store.get(old_sent_scheduled).await?.is_none());
    assert!(env.store.get(fresh_sent).await?.is_some());
    assert!(env.store.get(unsent).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn unsent_sweep_deletes_stale_rows_including_failed_ones() -> Result<()> {
    let env = OutboxTestEnv::with_config(retention_config());
    let now = env.clock.now_utc();

    let stale_unsent = DeferredMessageBuilder::new(now - chrono::Duration::days(31))
        .seed(&env.store)
        .await;
    let stale_failed = DeferredMessageBuilder::new(now - chrono::Duration::days(40))
        .failed(now - chrono::Duration::days(39), SendFailureReason::InvalidTopic)
        .seed(&env.store)
        .await;
    let recent_failed = DeferredMessageBuilder::new(now - chrono::Duration::days(2))
        .failed(now - chrono::Duration::days(1), SendFailureReason::InvalidTopic)
        .seed(&env.store)
        .await;
    let recent_unsent =
        DeferredMessageBuilder::new(now - chrono::Duration::days(10)).seed(&env.store).await;

    let summary = env.housekeeping().delete_old_messages().await?;
    assert_eq!(summary.deleted_sent, 0);
    assert_eq!(summary.deleted_unsent, 2);

    assert!(env.store.get(stale_unsent).await?.is_none());
    assert!(env.store.get(stale_failed).await?.is_none());
    // Failed rows inside the unsent retention stay queryable.
    assert!(env.store.get(recent_failed).await?.is_some());
    assert!(env.store.get(recent_unsent).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn housekeeping_is_idempotent_on_a_fixed_dataset() -> Result<()> {
    let env = OutboxTestEnv::with_config(retention_config());
    let now = env.clock.now_utc();

    for _ in 0..4 {
        DeferredMessageBuilder::new(now - chrono::Duration::days(5))
            .sent_scheduled_at(now - chrono::Duration::days(3))
            .seed(&env.store)
            .await;
    }
    DeferredMessageBuilder::new(now - chrono::Duration::hours(1)).seed(&env.store).await;

    let first = env.housekeeping().delete_old_messages().await?;
    assert_eq!(first.deleted_sent, 4);

    // Without advancing the clock the second run finds nothing further.
    let second = env.housekeeping().delete_old_messages().await?;
    assert_eq!(second.deleted_sent, 0);
    assert_eq!(second.deleted_unsent, 0);
    assert_eq!(env.store.snapshot().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn page_cap_bounds_one_run_and_later_runs_drain_the_rest() -> Result<()> {
    let config = OutboxConfig {
        housekeeping_page_size: 2,
        housekeeping_max_pages: 3,
        ..retention_config()
    };
    let env = OutboxTestEnv::with_config(config);
    let now = env.clock.now_utc();

    // 15 expired sent rows, plus 5 live scheduled messages that must
    // survive every sweep.
    for _ in 0..15 {
        DeferredMessageBuilder::new(now - chrono::Duration::days(5))
            .sent_scheduled_at(now - chrono::Duration::days(3))
            .seed(&env.store)
            .await;
    }
    env.enqueue_scheduled(5, "orders").await?;

    // 3 pages x 2 rows per run.
    let first = env.housekeeping().delete_old_messages().await?;
    assert_eq!(first.deleted_sent, 6);

    let second = env.housekeeping().delete_old_messages().await?;
    assert_eq!(second.deleted_sent, 6);

    let third = env.housekeeping().delete_old_messages().await?;
    assert_eq!(third.deleted_sent, 3);

    let fourth = env.housekeeping().delete_old_messages().await?;
    assert_eq!(fourth.deleted_sent, 0);

    // Only the live messages remain.
    let remaining = env.store.snapshot().await;
    assert_eq!(remaining.len(), 5);
    assert!(remaining.iter().all(|row| row.sent_scheduled_at.is_none()));
    Ok(())
}

#[tokio::test]
async fn both_sweeps_run_in_one_invocation() -> Result<()> {
    let env = OutboxTestEnv::with_config(retention_config());
    let now = env.clock.now_utc();

    DeferredMessageBuilder::new(now - chrono::Duration::days(5))
        .sent_immediately_at(now - chrono::Duration::days(3))
        .seed(&env.store)
        .await;
    DeferredMessageBuilder::new(now - chrono::Duration::days(31)).seed(&env.store).await;

    let summary = env.housekeeping().delete_old_messages().await?;
    assert_eq!(summary.deleted_sent, 1);
    assert_eq!(summary.deleted_unsent, 1);
    assert!(env.store.snapshot().await.is_empty());
    Ok(())
}
