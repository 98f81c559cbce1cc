//! Distributed lock contract for the scheduled jobs.
//!
//! The relay and housekeeping triggers must be serialized cluster-wide: at
//! most one instance executes a given task at a time, and a lock has a
//! bounded maximum validity shorter than the task's own deadline so a
//! stalled holder is eventually superseded. A distributed implementation
//! is a collaborator; [`LocalLockService`] covers single-process
//! deployments and tests.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use outbox_core::{storage::BoxFuture, Clock, RealClock};
use tracing::debug;

/// A held lock. Dropping the guard releases it.
pub type LockLease = Box<dyn LockGuard>;

/// Marker for lock guards; releasing happens on drop.
pub trait LockGuard: Send {}

/// Named mutual exclusion with bounded hold durations.
pub trait LockService: Send + Sync {
    /// Attempts to acquire the named lock.
    ///
    /// `min_hold` keeps the lock unavailable for that long from the
    /// acquisition even if the guard is dropped earlier, throttling how
    /// soon another instance can start the same task. `max_hold` bounds
    /// the lease: a holder that stalls past it is superseded.
    ///
    /// Returns `None` when the lock is currently unavailable; the caller
    /// skips this cycle.
    fn try_acquire<'a>(
        &'a self,
        name: &'a str,
        min_hold: Duration,
        max_hold: Duration,
    ) -> BoxFuture<'a, Option<LockLease>>;
}

#[derive(Debug, Clone, Copy)]
struct LockState {
    held: bool,
    /// Earliest instant the lock may be acquired again.
    not_before: Instant,
    /// Instant at which a stalled holder is superseded.
    expires_at: Instant,
    /// Identifies the current lease; a superseded lease must not release
    /// its successor's lock.
    generation: u64,
}

/// Single-process lock service.
///
/// Suitable when only one application instance runs the scheduled jobs.
/// Multi-instance deployments need a distributed implementation with the
/// same min/max hold semantics.
#[derive(Clone)]
pub struct LocalLockService {
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<HashMap<String, LockState>>>,
}

impl LocalLockService {
    /// Creates a lock service on the real clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(RealClock))
    }

    /// Creates a lock service on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { clock, state: Arc::new(Mutex::new(HashMap::new())) }
    }
}

impl Default for LocalLockService {
    fn default() -> Self {
        Self::new()
    }
}

impl LockService for LocalLockService {
    fn try_acquire<'a>(
        &'a self,
        name: &'a str,
        min_hold: Duration,
        max_hold: Duration,
    ) -> BoxFuture<'a, Option<LockLease>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

            let generation = match state.get(name) {
                Some(existing) => {
                    let superseded = existing.held && now >= existing.expires_at;
                    if existing.held && !superseded {
                        debug!(lock = name, "lock is held, skipping this cycle");
                        return None;
                    }
                    if !existing.held && now < existing.not_before {
                        debug!(
                            lock = name,
                            "lock minimum hold has not elapsed, skipping this cycle"
                        );
                        return None;
                    }
                    existing.generation + 1
                },
                None => 0,
            };

            state.insert(
                name.to_string(),
                LockState {
                    held: true,
                    not_before: now + min_hold,
                    expires_at: now + max_hold,
                    generation,
                },
            );

            Some(Box::new(LocalLockLease {
                name: name.to_string(),
                generation,
                state: self.state.clone(),
            }) as LockLease)
        })
    }
}

impl std::fmt::Debug for LocalLockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLockService").finish_non_exhaustive()
    }
}

struct LocalLockLease {
    name: String,
    generation: u64,
    state: Arc<Mutex<HashMap<String, LockState>>>,
}

impl LockGuard for LocalLockLease {}

impl Drop for LocalLockLease {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(lock) = state.get_mut(&self.name) {
            // The minimum hold window set at acquisition keeps throttling
            // re-acquisition after release.
            if lock.generation == self.generation {
                lock.held = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use outbox_core::TestClock;

    use super::*;

    fn service() -> (TestClock, LocalLockService) {
        let clock = TestClock::new();
        let service = LocalLockService::with_clock(Arc::new(clock.clone()));
        (clock, service)
    }

    #[tokio::test]
    async fn held_lock_is_unavailable() {
        let (_clock, service) = service();
        let lease = service
            .try_acquire("relay", Duration::from_secs(1), Duration::from_secs(60))
            .await;
        assert!(lease.is_some());

        let second = service
            .try_acquire("relay", Duration::from_secs(1), Duration::from_secs(60))
            .await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn released_lock_respects_minimum_hold() {
        let (clock, service) = service();
        let lease = service
            .try_acquire("relay", Duration::from_secs(10), Duration::from_secs(60))
            .await;
        drop(lease);

        assert!(service
            .try_acquire("relay", Duration::from_secs(10), Duration::from_secs(60))
            .await
            .is_none());

        clock.advance(Duration::from_secs(11));
        assert!(service
            .try_acquire("relay", Duration::from_secs(10), Duration::from_secs(60))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn stalled_holder_is_superseded_after_max_hold() {
        let (clock, service) = service();
        let lease = service
            .try_acquire("relay", Duration::from_secs(1), Duration::from_secs(30))
            .await;
        assert!(lease.is_some());
        // The holder stalls; the lease is intentionally kept alive.

        clock.advance(Duration::from_secs(31));
        let taken_over = service
            .try_acquire("relay", Duration::from_secs(1), Duration::from_secs(30))
            .await;
        assert!(taken_over.is_some());

        // Dropping the superseded lease must not release the new holder.
        drop(lease);
        assert!(service
            .try_acquire("relay", Duration::from_secs(1), Duration::from_secs(30))
            .await
            .is_none());
        drop(taken_over);
    }

    #[tokio::test]
    async fn distinct_names_do_not_contend() {
        let (_clock, service) = service();
        let relay = service
            .try_acquire("relay", Duration::from_secs(1), Duration::from_secs(60))
            .await;
        let housekeeping = service
            .try_acquire("housekeeping", Duration::from_secs(1), Duration::from_secs(60))
            .await;
        assert!(relay.is_some());
        assert!(housekeeping.is_some());
    }
}
