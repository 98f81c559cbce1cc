//! In-memory implementation of the outbox store.
//!
//! Mirrors the PostgreSQL store's semantics, including affected-row checks
//! and transactional staging, without a database. Used by the test suites
//! and suitable for embedded single-process deployments.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    error::{Result, StoreError},
    models::{DeferredMessage, FailedMessage, NewDeferredMessage, SendFailureReason},
    storage::{BoxFuture, IdPage, OutboxStore, StoreTransaction},
};

#[derive(Debug, Default)]
struct Inner {
    rows: BTreeMap<i64, DeferredMessage>,
    next_id: i64,
}

/// In-memory outbox store with the same observable semantics as
/// [`PgOutboxStore`](crate::storage::PgOutboxStore).
///
/// Cloning shares the underlying state.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutboxStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryOutboxStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all rows ordered by id.
    ///
    /// Test support; the production store has no equivalent full scan.
    pub async fn snapshot(&self) -> Vec<DeferredMessage> {
        self.inner.read().await.rows.values().cloned().collect()
    }

    /// Inserts a fully specified row, bypassing the enqueue path.
    ///
    /// Test support for seeding lifecycle states (sent, failed, aged rows)
    /// directly. Returns the assigned id.
    pub async fn seed(&self, mut message: DeferredMessage) -> i64 {
        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        message.id = inner.next_id;
        inner.rows.insert(message.id, message);
        inner.next_id
    }

    async fn update_row<F>(&self, id: i64, apply: F) -> Result<()>
    where
        F: FnOnce(&mut DeferredMessage),
    {
        let mut inner = self.inner.write().await;
        match inner.rows.get_mut(&id) {
            Some(row) => {
                apply(row);
                Ok(())
            },
            None => Err(StoreError::MessageNotFound(id)),
        }
    }
}

impl OutboxStore for MemoryOutboxStore {
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn StoreTransaction>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            Ok(Box::new(MemoryStoreTransaction {
                inner,
                staged_rows: Vec::new(),
                staged_schedule_after: Vec::new(),
                staged_deletes: BTreeSet::new(),
            }) as Box<dyn StoreTransaction>)
        })
    }

    fn get(&self, id: i64) -> BoxFuture<'_, Result<Option<DeferredMessage>>> {
        Box::pin(async move { Ok(self.inner.read().await.rows.get(&id).cloned()) })
    }

    fn mark_sent_immediately(&self, id: i64, sent_at: DateTime<Utc>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.update_row(id, |row| {
                row.sent_immediately_at = Some(sent_at);
            })
            .await
        })
    }

    fn mark_sent_scheduled(&self, id: i64, sent_at: DateTime<Utc>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.update_row(id, |row| {
                row.sent_scheduled_at = Some(sent_at);
                row.failed_at = None;
                row.fail_reason = None;
                row.resend = false;
            })
            .await
        })
    }

    fn mark_failed(
        &self,
        id: i64,
        failed_at: DateTime<Utc>,
        reason: SendFailureReason,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.update_row(id, |row| {
                row.failed_at = Some(failed_at);
                row.fail_reason = Some(reason);
                row.resend = false;
            })
            .await
        })
    }

    fn mark_for_resend(&self, id: i64, resend: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.update_row(id, |row| {
                row.resend = resend;
            })
            .await
        })
    }

    fn set_schedule_after(
        &self,
        id: i64,
        schedule_after: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.update_row(id, |row| {
                row.schedule_after = Some(schedule_after);
            })
            .await
        })
    }

    fn find_ready(
        &self,
        limit: u32,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<DeferredMessage>>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner
                .rows
                .values()
                .filter(|row| row.is_ready(now))
                .take(limit as usize)
                .cloned()
                .collect())
        })
    }

    fn count_ready(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<i64>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner.rows.values().filter(|row| row.is_ready(now)).count() as i64)
        })
    }

    fn count_failed(&self, resend: bool) -> BoxFuture<'_, Result<i64>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner
                .rows
                .values()
                .filter(|row| row.failed_at.is_some() && row.resend == resend)
                .count() as i64)
        })
    }

    fn count_failed_between(
        &self,
        failed_from: DateTime<Utc>,
        failed_before: DateTime<Utc>,
        resend: bool,
    ) -> BoxFuture<'_, Result<i64>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner
                .rows
                .values()
                .filter(|row| {
                    row.failed_at
                        .is_some_and(|failed| failed >= failed_from && failed < failed_before)
                        && row.resend == resend
                })
                .count() as i64)
        })
    }

    fn find_failed_between(
        &self,
        failed_from: DateTime<Utc>,
        failed_before: DateTime<Utc>,
        resend: bool,
        limit: u32,
    ) -> BoxFuture<'_, Result<Vec<FailedMessage>>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner
                .rows
                .values()
                .filter(|row| {
                    row.failed_at
                        .is_some_and(|failed| failed >= failed_from && failed < failed_before)
                        && row.resend == resend
                })
                .filter_map(FailedMessage::from_deferred)
                .take(limit as usize)
                .collect())
        })
    }

    fn find_failed_after_id(
        &self,
        after_id: i64,
        failed_before: DateTime<Utc>,
        resend: bool,
        limit: u32,
    ) -> BoxFuture<'_, Result<Vec<FailedMessage>>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner
                .rows
                .range(after_id + 1..)
                .map(|(_, row)| row)
                .filter(|row| {
                    row.failed_at.is_some_and(|failed| failed < failed_before)
                        && row.resend == resend
                })
                .filter_map(FailedMessage::from_deferred)
                .take(limit as usize)
                .collect())
        })
    }
}

/// A staged transaction on the in-memory store.
///
/// Inserts and updates accumulate locally and apply atomically on commit;
/// ids are drawn from the shared sequence at insert time, so a rolled-back
/// transaction consumes ids just like a database sequence would.
struct MemoryStoreTransaction {
    inner: Arc<RwLock<Inner>>,
    staged_rows: Vec<DeferredMessage>,
    staged_schedule_after: Vec<(i64, DateTime<Utc>)>,
    staged_deletes: BTreeSet<i64>,
}

impl MemoryStoreTransaction {
    fn id_page(rows: Vec<i64>, page_size: u32) -> IdPage {
        let has_more = rows.len() > page_size as usize;
        let mut ids = rows;
        ids.truncate(page_size as usize);
        IdPage { ids, has_more }
    }
}

impl StoreTransaction for MemoryStoreTransaction {
    fn insert(&mut self, message: NewDeferredMessage) -> BoxFuture<'_, Result<DeferredMessage>> {
        Box::pin(async move {
            let id = {
                let mut inner = self.inner.write().await;
                inner.next_id += 1;
                inner.next_id
            };

            let row = DeferredMessage {
                id,
                payload: message.payload,
                key: message.key,
                cluster_name: message.cluster_name,
                topic: message.topic,
                message_id: message.message_id,
                message_idempotence_id: message.message_idempotence_id,
                message_type_name: message.message_type_name,
                message_type_version: message.message_type_version,
                created_at: message.created_at,
                send_immediately: message.send_immediately,
                schedule_after: None,
                sent_immediately_at: None,
                sent_scheduled_at: None,
                failed_at: None,
                fail_reason: None,
                resend: false,
                trace_context: message.trace_context,
            };
            self.staged_rows.push(row.clone());
            Ok(row)
        })
    }

    fn set_schedule_after(
        &mut self,
        id: i64,
        schedule_after: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Some(staged) = self.staged_rows.iter_mut().find(|row| row.id == id) {
                staged.schedule_after = Some(schedule_after);
                return Ok(());
            }

            if !self.inner.read().await.rows.contains_key(&id) {
                return Err(StoreError::MessageNotFound(id));
            }
            self.staged_schedule_after.push((id, schedule_after));
            Ok(())
        })
    }

    fn find_sent_before_page(
        &mut self,
        cutoff: DateTime<Utc>,
        page_size: u32,
    ) -> BoxFuture<'_, Result<IdPage>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            let ids: Vec<i64> = inner
                .rows
                .values()
                .filter(|row| !self.staged_deletes.contains(&row.id))
                .filter(|row| {
                    row.sent_immediately_at.is_some_and(|sent| sent < cutoff)
                        || row.sent_scheduled_at.is_some_and(|sent| sent < cutoff)
                })
                .map(|row| row.id)
                .take(page_size as usize + 1)
                .collect();

            Ok(Self::id_page(ids, page_size))
        })
    }

    fn find_unsent_created_before_page(
        &mut self,
        cutoff: DateTime<Utc>,
        page_size: u32,
    ) -> BoxFuture<'_, Result<IdPage>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            let ids: Vec<i64> = inner
                .rows
                .values()
                .filter(|row| !self.staged_deletes.contains(&row.id))
                .filter(|row| {
                    row.sent_immediately_at.is_none()
                        && row.sent_scheduled_at.is_none()
                        && row.created_at < cutoff
                })
                .map(|row| row.id)
                .take(page_size as usize + 1)
                .collect();

            Ok(Self::id_page(ids, page_size))
        })
    }

    fn delete_by_ids(&mut self, ids: Vec<i64>) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            let mut deleted = 0;
            for id in ids {
                if inner.rows.contains_key(&id) && self.staged_deletes.insert(id) {
                    deleted += 1;
                }
            }
            Ok(deleted)
        })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            for row in self.staged_rows {
                inner.rows.insert(row.id, row);
            }
            for (id, schedule_after) in self.staged_schedule_after {
                if let Some(row) = inner.rows.get_mut(&id) {
                    row.schedule_after = Some(schedule_after);
                }
            }
            for id in &self.staged_deletes {
                inner.rows.remove(id);
            }
            Ok(())
        })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move { Ok(()) })
    }
}
