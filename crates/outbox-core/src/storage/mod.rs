//! Storage abstraction for the durable message store.
//!
//! Provides trait-based access to deferred messages so the engine can run
//! against PostgreSQL in production and an in-memory store in tests. All
//! state transitions are single-row conditional updates; an update that
//! affects zero rows is reported as
//! [`StoreError::MessageNotFound`](crate::error::StoreError::MessageNotFound)
//! by every implementation, never swallowed.

use std::{future::Future, pin::Pin};

use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    models::{DeferredMessage, FailedMessage, NewDeferredMessage, SendFailureReason},
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryOutboxStore;
pub use postgres::PgOutboxStore;

/// Boxed future alias used by the dyn-compatible storage traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One page of candidate ids from a paginated housekeeping query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdPage {
    /// Ids on this page, ordered ascending.
    pub ids: Vec<i64>,
    /// Whether a further page exists beyond this one.
    pub has_more: bool,
}

impl IdPage {
    /// Whether this page is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// An open store transaction.
///
/// Wraps the underlying database transaction and exposes the operations the
/// outbox performs inside a caller transaction (inserts, the pre-commit
/// schedule-after update) and inside housekeeping page transactions.
/// Dropping the handle without calling [`commit`](Self::commit) discards all
/// staged changes.
pub trait StoreTransaction: Send {
    /// Inserts a new deferred message and returns the persisted row.
    ///
    /// The store assigns the id from its sequence; ids are monotonically
    /// increasing and never reused, even when the transaction rolls back.
    fn insert(&mut self, message: NewDeferredMessage) -> BoxFuture<'_, Result<DeferredMessage>>;

    /// Sets the earliest relay delivery time of a message in this transaction.
    fn set_schedule_after(
        &mut self,
        id: i64,
        schedule_after: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<()>>;

    /// Fetches one page of ids of messages sent before the cutoff.
    ///
    /// Matches rows whose `sent_immediately_at` or `sent_scheduled_at` lies
    /// before `cutoff`, ordered by id.
    fn find_sent_before_page(
        &mut self,
        cutoff: DateTime<Utc>,
        page_size: u32,
    ) -> BoxFuture<'_, Result<IdPage>>;

    /// Fetches one page of ids of never-sent messages created before the
    /// cutoff.
    ///
    /// Matches rows with both sent timestamps null and `created_at` before
    /// `cutoff`, regardless of failure state, ordered by id.
    fn find_unsent_created_before_page(
        &mut self,
        cutoff: DateTime<Utc>,
        page_size: u32,
    ) -> BoxFuture<'_, Result<IdPage>>;

    /// Deletes exactly the given ids, returning the number of deleted rows.
    fn delete_by_ids(&mut self, ids: Vec<i64>) -> BoxFuture<'_, Result<u64>>;

    /// Commits the transaction.
    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<()>>;

    /// Rolls the transaction back, discarding all staged changes.
    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

/// Durable store of deferred messages.
///
/// Single-row operations outside a [`StoreTransaction`] run in their own
/// short transaction (auto-commit); this is what the post-commit sender and
/// the relay rely on to persist each state transition independently of the
/// surrounding work.
pub trait OutboxStore: Send + Sync + 'static {
    /// Begins a new store transaction.
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn StoreTransaction>>>;

    /// Fetches a message by id.
    fn get(&self, id: i64) -> BoxFuture<'_, Result<Option<DeferredMessage>>>;

    /// Marks a message as sent by the post-commit sender.
    ///
    /// Sets only `sent_immediately_at`.
    fn mark_sent_immediately(
        &self,
        id: i64,
        sent_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<()>>;

    /// Marks a message as sent by the relay.
    ///
    /// Sets `sent_scheduled_at` and clears the failure state and the resend
    /// flag, completing a resend cycle.
    fn mark_sent_scheduled(&self, id: i64, sent_at: DateTime<Utc>) -> BoxFuture<'_, Result<()>>;

    /// Records a message-caused send failure.
    ///
    /// Sets `failed_at`/`fail_reason` and clears the resend flag.
    fn mark_failed(
        &self,
        id: i64,
        failed_at: DateTime<Utc>,
        reason: SendFailureReason,
    ) -> BoxFuture<'_, Result<()>>;

    /// Sets or clears the explicit resend request.
    fn mark_for_resend(&self, id: i64, resend: bool) -> BoxFuture<'_, Result<()>>;

    /// Sets the earliest relay delivery time outside a transaction.
    fn set_schedule_after(
        &self,
        id: i64,
        schedule_after: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<()>>;

    /// Fetches up to `limit` ready messages ordered by id ascending.
    ///
    /// Readiness is evaluated against the supplied `now`; see
    /// [`DeferredMessage::is_ready`].
    fn find_ready(
        &self,
        limit: u32,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<DeferredMessage>>>;

    /// Counts ready messages (the relay lag).
    fn count_ready(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<i64>>;

    /// Counts failed messages by resend flag.
    fn count_failed(&self, resend: bool) -> BoxFuture<'_, Result<i64>>;

    /// Counts messages that failed within `[failed_from, failed_before)`
    /// with the given resend flag.
    fn count_failed_between(
        &self,
        failed_from: DateTime<Utc>,
        failed_before: DateTime<Utc>,
        resend: bool,
    ) -> BoxFuture<'_, Result<i64>>;

    /// Finds failed messages within `[failed_from, failed_before)`, ordered
    /// by id ascending, at most `limit` results.
    fn find_failed_between(
        &self,
        failed_from: DateTime<Utc>,
        failed_before: DateTime<Utc>,
        resend: bool,
        limit: u32,
    ) -> BoxFuture<'_, Result<Vec<FailedMessage>>>;

    /// Finds failed messages with id greater than `after_id` that failed
    /// before `failed_before`, ordered by id ascending, at most `limit`
    /// results.
    fn find_failed_after_id(
        &self,
        after_id: i64,
        failed_before: DateTime<Utc>,
        resend: bool,
        limit: u32,
    ) -> BoxFuture<'_, Result<Vec<FailedMessage>>>;
}
