//! PostgreSQL implementation of the outbox store.
//!
//! Raw sqlx queries with explicit column lists. Every state transition
//! checks the affected-row count and reports zero rows as
//! [`StoreError::MessageNotFound`]; no optimistic versioning is used, the
//! single-row atomic update is the sole concurrency-control primitive.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    error::{Result, StoreError},
    models::{DeferredMessage, FailedMessage, NewDeferredMessage, SendFailureReason},
    storage::{BoxFuture, IdPage, OutboxStore, StoreTransaction},
};

const MESSAGE_COLUMNS: &str = "id, payload, message_key, cluster_name, topic, message_id, \
     message_idempotence_id, message_type_name, message_type_version, created_at, \
     send_immediately, schedule_after, sent_immediately_at, sent_scheduled_at, failed_at, \
     fail_reason, resend, trace_id_high, trace_id, span_id, parent_span_id, trace_id_string";

const FAILED_COLUMNS: &str =
    "id, topic, message_id, message_idempotence_id, message_type_name, created_at, failed_at, \
     fail_reason, resend";

/// Readiness predicate shared by the relay fetch and the lag gauge.
///
/// `$1` binds the evaluation instant. An immediate message with no
/// `schedule_after` yet is not ready (`$1 > NULL` is NULL).
const READY_CONDITION: &str = "(sent_immediately_at IS NULL AND sent_scheduled_at IS NULL \
     AND failed_at IS NULL \
     AND (send_immediately = FALSE OR $1 > schedule_after)) \
     OR resend = TRUE";

/// PostgreSQL-backed outbox store.
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    /// Creates a new store on the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the outbox schema if it does not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(include_str!(
            "../../migrations/20240612000001_create_deferred_message.sql"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_one(&self, id: i64, query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>) -> Result<()> {
        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MessageNotFound(id));
        }
        Ok(())
    }
}

impl OutboxStore for PgOutboxStore {
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn StoreTransaction>>> {
        Box::pin(async move {
            let tx = self.pool.begin().await?;
            Ok(Box::new(PgStoreTransaction { tx }) as Box<dyn StoreTransaction>)
        })
    }

    fn get(&self, id: i64) -> BoxFuture<'_, Result<Option<DeferredMessage>>> {
        Box::pin(async move {
            let message = sqlx::query_as::<_, DeferredMessage>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM deferred_message WHERE id = $1"
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

            Ok(message)
        })
    }

    fn mark_sent_immediately(&self, id: i64, sent_at: DateTime<Utc>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.update_one(
                id,
                sqlx::query(
                    "UPDATE deferred_message SET sent_immediately_at = $1 WHERE id = $2",
                )
                .bind(sent_at)
                .bind(id),
            )
            .await
        })
    }

    fn mark_sent_scheduled(&self, id: i64, sent_at: DateTime<Utc>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.update_one(
                id,
                sqlx::query(
                    "UPDATE deferred_message \
                     SET sent_scheduled_at = $1, failed_at = NULL, fail_reason = NULL, \
                         resend = FALSE \
                     WHERE id = $2",
                )
                .bind(sent_at)
                .bind(id),
            )
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
            self.update_one(
                id,
                sqlx::query(
                    "UPDATE deferred_message \
                     SET failed_at = $1, fail_reason = $2, resend = FALSE \
                     WHERE id = $3",
                )
                .bind(failed_at)
                .bind(reason)
                .bind(id),
            )
            .await
        })
    }

    fn mark_for_resend(&self, id: i64, resend: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.update_one(
                id,
                sqlx::query("UPDATE deferred_message SET resend = $1 WHERE id = $2")
                    .bind(resend)
                    .bind(id),
            )
            .await
        })
    }

    fn set_schedule_after(
        &self,
        id: i64,
        schedule_after: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.update_one(
                id,
                sqlx::query("UPDATE deferred_message SET schedule_after = $1 WHERE id = $2")
                    .bind(schedule_after)
                    .bind(id),
            )
            .await
        })
    }

    fn find_ready(
        &self,
        limit: u32,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<DeferredMessage>>> {
        Box::pin(async move {
            let messages = sqlx::query_as::<_, DeferredMessage>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM deferred_message \
                 WHERE {READY_CONDITION} ORDER BY id ASC LIMIT $2"
            ))
            .bind(now)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

            Ok(messages)
        })
    }

    fn count_ready(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<i64>> {
        Box::pin(async move {
            let count: (i64,) = sqlx::query_as(&format!(
                "SELECT COUNT(*) FROM deferred_message WHERE {READY_CONDITION}"
            ))
            .bind(now)
            .fetch_one(&self.pool)
            .await?;

            Ok(count.0)
        })
    }

    fn count_failed(&self, resend: bool) -> BoxFuture<'_, Result<i64>> {
        Box::pin(async move {
            let count: (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM deferred_message \
                 WHERE failed_at IS NOT NULL AND resend = $1",
            )
            .bind(resend)
            .fetch_one(&self.pool)
            .await?;

            Ok(count.0)
        })
    }

    fn count_failed_between(
        &self,
        failed_from: DateTime<Utc>,
        failed_before: DateTime<Utc>,
        resend: bool,
    ) -> BoxFuture<'_, Result<i64>> {
        Box::pin(async move {
            let count: (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM deferred_message \
                 WHERE failed_at IS NOT NULL AND failed_at >= $1 AND failed_at < $2 \
                   AND resend = $3",
            )
            .bind(failed_from)
            .bind(failed_before)
            .bind(resend)
            .fetch_one(&self.pool)
            .await?;

            Ok(count.0)
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
            let messages = sqlx::query_as::<_, FailedMessage>(&format!(
                "SELECT {FAILED_COLUMNS} FROM deferred_message \
                 WHERE failed_at IS NOT NULL AND failed_at >= $1 AND failed_at < $2 \
                   AND resend = $3 \
                 ORDER BY id ASC LIMIT $4"
            ))
            .bind(failed_from)
            .bind(failed_before)
            .bind(resend)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

            Ok(messages)
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
            let messages = sqlx::query_as::<_, FailedMessage>(&format!(
                "SELECT {FAILED_COLUMNS} FROM deferred_message \
                 WHERE failed_at IS NOT NULL AND id > $1 AND failed_at < $2 AND resend = $3 \
                 ORDER BY id ASC LIMIT $4"
            ))
            .bind(after_id)
            .bind(failed_before)
            .bind(resend)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

            Ok(messages)
        })
    }
}

/// An open PostgreSQL transaction on the outbox table.
pub struct PgStoreTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgStoreTransaction {
    /// Access to the underlying sqlx transaction.
    ///
    /// Lets the caller persist its own domain writes in the same
    /// transaction as the enqueued messages, which is the whole point of
    /// the outbox pattern.
    pub fn sqlx_transaction(&mut self) -> &mut Transaction<'static, Postgres> {
        &mut self.tx
    }

    async fn fetch_id_page(
        &mut self,
        query: &str,
        cutoff: DateTime<Utc>,
        page_size: u32,
    ) -> Result<IdPage> {
        // Fetch one extra row to learn whether a further page exists.
        let mut ids: Vec<i64> = sqlx::query_scalar(query)
            .bind(cutoff)
            .bind(i64::from(page_size) + 1)
            .fetch_all(&mut *self.tx)
            .await?;

        let has_more = ids.len() > page_size as usize;
        ids.truncate(page_size as usize);

        Ok(IdPage { ids, has_more })
    }
}

impl StoreTransaction for PgStoreTransaction {
    fn insert(&mut self, message: NewDeferredMessage) -> BoxFuture<'_, Result<DeferredMessage>> {
        Box::pin(async move {
            let trace = message.trace_context.clone().unwrap_or_default();
            let persisted = sqlx::query_as::<_, DeferredMessage>(&format!(
                "INSERT INTO deferred_message (\
                     payload, message_key, cluster_name, topic, message_id, \
                     message_idempotence_id, message_type_name, message_type_version, \
                     created_at, send_immediately, trace_id_high, trace_id, span_id, \
                     parent_span_id, trace_id_string\
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
                 RETURNING {MESSAGE_COLUMNS}"
            ))
            .bind(&message.payload)
            .bind(&message.key)
            .bind(&message.cluster_name)
            .bind(&message.topic)
            .bind(&message.message_id)
            .bind(&message.message_idempotence_id)
            .bind(&message.message_type_name)
            .bind(&message.message_type_version)
            .bind(message.created_at)
            .bind(message.send_immediately)
            .bind(trace.trace_id_high)
            .bind(trace.trace_id)
            .bind(trace.span_id)
            .bind(trace.parent_span_id)
            .bind(&trace.trace_id_string)
            .fetch_one(&mut *self.tx)
            .await?;

            Ok(persisted)
        })
    }

    fn set_schedule_after(
        &mut self,
        id: i64,
        schedule_after: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let result =
                sqlx::query("UPDATE deferred_message SET schedule_after = $1 WHERE id = $2")
                    .bind(schedule_after)
                    .bind(id)
                    .execute(&mut *self.tx)
                    .await?;

            if result.rows_affected() == 0 {
                return Err(StoreError::MessageNotFound(id));
            }
            Ok(())
        })
    }

    fn find_sent_before_page(
        &mut self,
        cutoff: DateTime<Utc>,
        page_size: u32,
    ) -> BoxFuture<'_, Result<IdPage>> {
        Box::pin(async move {
            self.fetch_id_page(
                "SELECT id FROM deferred_message \
                 WHERE sent_immediately_at < $1 OR sent_scheduled_at < $1 \
                 ORDER BY id ASC LIMIT $2",
                cutoff,
                page_size,
            )
            .await
        })
    }

    fn find_unsent_created_before_page(
        &mut self,
        cutoff: DateTime<Utc>,
        page_size: u32,
    ) -> BoxFuture<'_, Result<IdPage>> {
        Box::pin(async move {
            self.fetch_id_page(
                "SELECT id FROM deferred_message \
                 WHERE sent_immediately_at IS NULL AND sent_scheduled_at IS NULL \
                   AND created_at < $1 \
                 ORDER BY id ASC LIMIT $2",
                cutoff,
                page_size,
            )
            .await
        })
    }

    fn delete_by_ids(&mut self, ids: Vec<i64>) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(0);
            }

            let result = sqlx::query("DELETE FROM deferred_message WHERE id = ANY($1)")
                .bind(&ids)
                .execute(&mut *self.tx)
                .await?;

            Ok(result.rows_affected())
        })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move { self.tx.commit().await.map_err(StoreError::from) })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move { self.tx.rollback().await.map_err(StoreError::from) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_can_be_created_lazily() {
        let pool = PgPool::connect_lazy("postgresql://localhost/outbox").unwrap();
        let _store = PgOutboxStore::new(pool);
    }
}
