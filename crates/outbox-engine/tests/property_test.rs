//! Stateful property test: random action sequences against the outbox
//! must never violate the message state invariants.

use std::time::Duration;

use outbox_engine::SendError;
use outbox_testing::{
    check_message_invariants, OutboxTestEnv, SendScript, TestMessage,
};
use proptest::{prelude::*, test_runner::TestCaseError};

#[derive(Debug, Clone)]
enum Action {
    EnqueueImmediate { count: usize },
    EnqueueScheduled { count: usize },
    EnqueueAndRollback,
    RelayRun,
    FailNextGeneral,
    FailNextMessageCaused,
    ResendAllFailed,
    Housekeeping,
    AdvanceTime { seconds: u64 },
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        3 => (1usize..4).prop_map(|count| Action::EnqueueImmediate { count }),
        3 => (1usize..4).prop_map(|count| Action::EnqueueScheduled { count }),
        1 => Just(Action::EnqueueAndRollback),
        3 => Just(Action::RelayRun),
        2 => Just(Action::FailNextGeneral),
        2 => Just(Action::FailNextMessageCaused),
        1 => Just(Action::ResendAllFailed),
        1 => Just(Action::Housekeeping),
        2 => (1u64..200_000).prop_map(|seconds| Action::AdvanceTime { seconds }),
    ]
}

async fn apply(env: &OutboxTestEnv, action: Action) -> anyhow::Result<()> {
    match action {
        Action::EnqueueImmediate { count } => {
            env.enqueue_immediate(count, "orders").await?;
        },
        Action::EnqueueScheduled { count } => {
            env.enqueue_scheduled(count, "orders").await?;
        },
        Action::EnqueueAndRollback => {
            let mut tx = env.outbox.transaction().await?;
            tx.send(&TestMessage::new("rolled back"), "orders").await?;
            tx.rollback().await?;
        },
        Action::RelayRun => {
            env.relay().relay().await?;
        },
        Action::FailNextGeneral => {
            env.sender.script_next(SendScript::Fail(SendError::general("broker unreachable")));
        },
        Action::FailNextMessageCaused => {
            env.sender
                .script_next(SendScript::Fail(SendError::unauthorized_on_topic("orders")));
        },
        Action::ResendAllFailed => {
            for row in env.store.snapshot().await {
                if row.failed_at.is_some() {
                    env.outbox.resend_message_scheduled(row.id).await?;
                }
            }
        },
        Action::Housekeeping => {
            env.housekeeping().delete_old_messages().await?;
        },
        Action::AdvanceTime { seconds } => {
            env.clock.advance(Duration::from_secs(seconds));
        },
    }
    Ok(())
}

async fn run_sequence(actions: Vec<Action>) -> anyhow::Result<()> {
    let env = OutboxTestEnv::new();

    for action in actions {
        apply(&env, action).await?;

        for row in env.store.snapshot().await {
            if let Err(violation) = check_message_invariants(&row) {
                anyhow::bail!("invariant violated: {violation}");
            }
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

    #[test]
    fn invariants_hold_after_any_action_sequence(
        actions in prop::collection::vec(action_strategy(), 1..32)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        runtime.block_on(run_sequence(actions)).map_err(|e| {
            TestCaseError::fail(e.to_string())
        })?;
    }
}
