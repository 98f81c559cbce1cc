//! Deterministic test support for the transactional outbox.
//!
//! Provides a ready-wired test environment over the in-memory store, a
//! scripted mock sender, row builders for arbitrary lifecycle states and
//! invariant checks. Everything runs on a shared test clock, so timing
//! behavior (relay deadlines, safety delays, retention cutoffs) is
//! reproducible without real waiting.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod env;
pub mod fixtures;
pub mod invariants;
pub mod sender;

pub use codec::{TestCodec, TestContractValidator, TestKey, TestMessage};
pub use env::{OutboxTestEnv, TEST_CLUSTER};
pub use fixtures::DeferredMessageBuilder;
pub use invariants::{assert_store_invariants, check_message_invariants};
pub use outbox_core::TestClock;
pub use sender::{MockSender, SendScript, SentRecord};

/// Initializes test logging from `RUST_LOG`, once per process.
///
/// Safe to call from every test; repeated initialization is ignored.
pub fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
