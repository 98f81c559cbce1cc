//! Housekeeping: paginated deletion of expired outbox rows.
//!
//! Two independent sweeps run per invocation: one for successfully sent
//! messages past the sent retention, one for never-sent messages past the
//! unsent retention. Each page is fetched and deleted in its own freshly
//! started transaction, bounding transaction size and lock duration; a
//! hard page cap guarantees termination on any backlog.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use outbox_core::{storage::StoreTransaction, Clock, OutboxStore, RealClock};
use tracing::{debug, info};

use crate::{
    config::{to_chrono, OutboxConfig},
    error::Result,
};

/// Outcome of one housekeeping run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingSummary {
    /// Deleted rows that had been successfully sent before the cutoff.
    pub deleted_sent: u64,
    /// Deleted rows that were never sent and created before the cutoff.
    pub deleted_unsent: u64,
}

#[derive(Debug, Clone, Copy)]
enum Sweep {
    SentBefore,
    UnsentCreatedBefore,
}

/// The housekeeping job.
pub struct Housekeeping {
    store: Arc<dyn OutboxStore>,
    config: OutboxConfig,
    clock: Arc<dyn Clock>,
}

impl Housekeeping {
    /// Creates a housekeeping job over the given store.
    pub fn new(store: Arc<dyn OutboxStore>, config: OutboxConfig) -> Self {
        Self { store, config, clock: Arc::new(RealClock) }
    }

    /// Sets the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Deletes expired rows.
    ///
    /// Sweep A removes rows with either sent timestamp before
    /// `now - sent_retention`. Sweep B removes rows with both sent
    /// timestamps null and `created_at` before `now - unsent_retention`;
    /// this also covers permanently failed rows once they age out, and
    /// messages that could never be processed at all. Rows newer than
    /// their cutoff are never touched, so running twice on a fixed dataset
    /// deletes nothing further the first run did not already remove.
    ///
    /// Each sweep is capped at `housekeeping_max_pages` pages; a larger
    /// backlog is drained by subsequent runs.
    ///
    /// # Errors
    ///
    /// Returns an error when a page transaction fails; pages committed
    /// before the failure stay deleted.
    pub async fn delete_old_messages(&self) -> Result<HousekeepingSummary> {
        info!("house keeping: deleting old messages");
        let now = self.clock.now_utc();

        let sent_cutoff = now - to_chrono(self.config.sent_retention);
        let deleted_sent = self.sweep(Sweep::SentBefore, sent_cutoff).await?;

        let unsent_cutoff = now - to_chrono(self.config.unsent_retention);
        let deleted_unsent = self.sweep(Sweep::UnsentCreatedBefore, unsent_cutoff).await?;

        info!(
            deleted_sent,
            deleted_unsent,
            "house keeping: done, deleted sent and not yet sent messages"
        );
        Ok(HousekeepingSummary { deleted_sent, deleted_unsent })
    }

    async fn sweep(&self, sweep: Sweep, cutoff: DateTime<Utc>) -> Result<u64> {
        let page_size = self.config.housekeeping_page_size;
        let mut deleted = 0u64;

        for page_index in 0..self.config.housekeeping_max_pages {
            let mut tx = self.store.begin().await?;
            let page = match sweep {
                Sweep::SentBefore => tx.find_sent_before_page(cutoff, page_size).await?,
                Sweep::UnsentCreatedBefore => {
                    tx.find_unsent_created_before_page(cutoff, page_size).await?
                },
            };

            if page.is_empty() {
                tx.rollback().await?;
                break;
            }

            debug!(
                page_index,
                count = page.ids.len(),
                has_more = page.has_more,
                "deleting one page of expired deferred messages"
            );
            deleted += tx.delete_by_ids(page.ids.clone()).await?;
            tx.commit().await?;

            if !page.has_more {
                break;
            }
        }

        Ok(deleted)
    }
}

impl std::fmt::Debug for Housekeeping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Housekeeping").field("config", &self.config).finish_non_exhaustive()
    }
}
