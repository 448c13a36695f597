//! Per-subscription distributed lock
//!
//! Serializes billing-engine operations (cycle materialization, invoice
//! finalization, reconciliation) on the same subscription so concurrent
//! cadence jobs and user-triggered calls never race. Backed by the same
//! `GrantStore`-style durable store via `LockStore`, with an in-memory
//! implementation for tests.

use crate::config::LockConfig;
use crate::errors::{LockError, LockResult};
use crate::types::{EpochMillis, SubscriptionLockRow};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

/// Durable storage for lock rows, separated from `GrantStore`/`BillingStore`
/// so either engine can share one lock table.
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn try_insert(&self, row: SubscriptionLockRow) -> LockResult<bool>;
    async fn read(&self, project_id: Uuid, subscription_id: Uuid) -> LockResult<Option<SubscriptionLockRow>>;
    async fn compare_and_swap(&self, row: SubscriptionLockRow, expected_owner: &str) -> LockResult<bool>;
    async fn delete(&self, project_id: Uuid, subscription_id: Uuid, owner: &str) -> LockResult<bool>;
}

/// In-memory `LockStore`, keyed by `(project_id, subscription_id)`.
#[derive(Default)]
pub struct InMemoryLockStore {
    rows: DashMap<(Uuid, Uuid), SubscriptionLockRow>,
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_insert(&self, row: SubscriptionLockRow) -> LockResult<bool> {
        let key = (row.project_id, row.subscription_id);
        Ok(match self.rows.entry(key) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(row);
                true
            }
            dashmap::mapref::entry::Entry::Occupied(_) => false,
        })
    }

    async fn read(&self, project_id: Uuid, subscription_id: Uuid) -> LockResult<Option<SubscriptionLockRow>> {
        Ok(self.rows.get(&(project_id, subscription_id)).map(|r| r.clone()))
    }

    async fn compare_and_swap(&self, row: SubscriptionLockRow, expected_owner: &str) -> LockResult<bool> {
        let key = (row.project_id, row.subscription_id);
        match self.rows.get_mut(&key) {
            Some(mut existing) if existing.owner == expected_owner => {
                *existing = row;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, project_id: Uuid, subscription_id: Uuid, owner: &str) -> LockResult<bool> {
        let key = (project_id, subscription_id);
        let removed = match self.rows.get(&key) {
            Some(existing) if existing.owner == owner => {
                self.rows.remove(&key);
                true
            }
            _ => false,
        };
        Ok(removed)
    }
}

/// A held lock handle. Dropping this without calling `release` leaves the
/// row in place until its TTL or stale-owner window lapses.
pub struct LockHandle {
    pub project_id: Uuid,
    pub subscription_id: Uuid,
    pub owner: String,
    pub acquired_at: EpochMillis,
    pub expires_at: EpochMillis,
}

/// Subscription-scoped distributed lock over a `LockStore`.
pub struct SubscriptionLock {
    store: Arc<dyn LockStore>,
    config: LockConfig,
}

impl SubscriptionLock {
    pub fn new(store: Arc<dyn LockStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    /// Acquires the lock, taking it over if the current holder is stale
    /// (past `expiresAt` by `staleTakeoverMs`, or un-renewed for
    /// `ownerStaleMs`).2.
    pub async fn acquire(
        &self,
        project_id: Uuid,
        subscription_id: Uuid,
        owner: &str,
        now: EpochMillis,
    ) -> LockResult<LockHandle> {
        let expires_at = now + self.config.ttl.as_millis() as EpochMillis;
        let row = SubscriptionLockRow {
            project_id,
            subscription_id,
            owner: owner.to_string(),
            acquired_at: now,
            expires_at,
        };

        if self.store.try_insert(row.clone()).await? {
            debug!(%subscription_id, owner, "subscription lock acquired");
            return Ok(LockHandle { project_id, subscription_id, owner: owner.to_string(), acquired_at: now, expires_at });
        }

        let existing = self.store.read(project_id, subscription_id).await?;
        let stale = match &existing {
            Some(row) => {
                let stale_takeover_ms = self.config.stale_takeover.as_millis() as EpochMillis;
                let owner_stale_ms = self.config.owner_stale.as_millis() as EpochMillis;
                now > row.expires_at + stale_takeover_ms || now > row.acquired_at + owner_stale_ms
            }
            None => true,
        };

        if !stale {
            return Err(LockError::Busy { subscription_id: subscription_id.to_string() });
        }

        let prior_owner = existing.map(|r| r.owner).unwrap_or_default();
        warn!(%subscription_id, prior_owner, "taking over stale subscription lock");
        if self.store.compare_and_swap(row.clone(), &prior_owner).await? {
            Ok(LockHandle { project_id, subscription_id, owner: owner.to_string(), acquired_at: now, expires_at })
        } else {
            Err(LockError::Busy { subscription_id: subscription_id.to_string() })
        }
    }

    /// Extends a held lock's TTL, proving ownership via compare-and-swap
    ///. Used by the heartbeat loop.
    pub async fn extend(&self, handle: &mut LockHandle, now: EpochMillis) -> LockResult<()> {
        let expires_at = now + self.config.ttl.as_millis() as EpochMillis;
        let row = SubscriptionLockRow {
            project_id: handle.project_id,
            subscription_id: handle.subscription_id,
            owner: handle.owner.clone(),
            acquired_at: handle.acquired_at,
            expires_at,
        };
        if self.store.compare_and_swap(row, &handle.owner).await? {
            handle.expires_at = expires_at;
            Ok(())
        } else {
            Err(LockError::OwnershipLost)
        }
    }

    pub async fn release(&self, handle: LockHandle) -> LockResult<()> {
        self.store.delete(handle.project_id, handle.subscription_id, &handle.owner).await?;
        debug!(subscription_id = %handle.subscription_id, "subscription lock released");
        Ok(())
    }

    /// Runs `work` while a background task renews the lock at
    /// `heartbeat_interval(ttl)`, capped at `max_hold(ttl)` total hold time
    ///. The lock is always released on the way out.
    /// Renewal failures only stop the heartbeat task, not `work` itself —
    /// the caller learns about ownership loss through the final `release`
    /// call or a subsequent lock-protected operation failing.
    pub async fn with_heartbeat<F, Fut, T>(
        self: Arc<Self>,
        project_id: Uuid,
        subscription_id: Uuid,
        owner: &str,
        now: EpochMillis,
        work: F,
    ) -> LockResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let handle = self.acquire(project_id, subscription_id, owner, now).await?;
        let heartbeat_interval = crate::config::heartbeat_interval(self.config.ttl);
        let max_hold = crate::config::max_hold(self.config.ttl);

        let lock = self.clone();
        let owner_owned = handle.owner.clone();
        let started = handle.acquired_at;
        let heartbeat = tokio::spawn(async move {
            let mut elapsed = std::time::Duration::ZERO;
            let mut current = handle;
            while elapsed < max_hold {
                sleep(heartbeat_interval).await;
                elapsed += heartbeat_interval;
                let now = started + elapsed.as_millis() as EpochMillis;
                if lock.extend(&mut current, now).await.is_err() {
                    warn!(subscription_id = %subscription_id, owner = %owner_owned, "lost subscription lock ownership during heartbeat");
                    return current;
                }
            }
            current
        });

        let result = work().await;
        heartbeat.abort();
        let final_handle = match heartbeat.await {
            Ok(handle) => handle,
            Err(_) => LockHandle { project_id, subscription_id, owner: owner.to_string(), acquired_at: started, expires_at: now },
        };
        self.release(final_handle).await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> LockConfig {
        LockConfig {
            ttl: Duration::from_millis(100),
            stale_takeover: Duration::from_millis(200),
            owner_stale: Duration::from_millis(200),
            heartbeat_min_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn acquire_then_busy_for_second_owner() {
        let store = Arc::new(InMemoryLockStore::default());
        let lock = SubscriptionLock::new(store, config());
        let project_id = Uuid::new_v4();
        let subscription_id = Uuid::new_v4();

        let handle = lock.acquire(project_id, subscription_id, "owner-a", 0).await.unwrap();
        let err = lock.acquire(project_id, subscription_id, "owner-b", 1).await.unwrap_err();
        assert!(matches!(err, LockError::Busy { .. }));

        lock.release(handle).await.unwrap();
        assert!(lock.acquire(project_id, subscription_id, "owner-b", 2).await.is_ok());
    }

    #[tokio::test]
    async fn stale_lock_is_taken_over() {
        let store = Arc::new(InMemoryLockStore::default());
        let lock = SubscriptionLock::new(store, config());
        let project_id = Uuid::new_v4();
        let subscription_id = Uuid::new_v4();

        let _handle = lock.acquire(project_id, subscription_id, "owner-a", 0).await.unwrap();
        // Well past stale_takeover + ttl.
        let handle2 = lock.acquire(project_id, subscription_id, "owner-b", 10_000).await.unwrap();
        assert_eq!(handle2.owner, "owner-b");
    }

    #[tokio::test]
    async fn extend_fails_after_ownership_lost() {
        let store = Arc::new(InMemoryLockStore::default());
        let lock = SubscriptionLock::new(store, config());
        let project_id = Uuid::new_v4();
        let subscription_id = Uuid::new_v4();

        let mut handle = lock.acquire(project_id, subscription_id, "owner-a", 0).await.unwrap();
        let _taken = lock.acquire(project_id, subscription_id, "owner-b", 10_000).await.unwrap();
        let err = lock.extend(&mut handle, 10_001).await.unwrap_err();
        assert!(matches!(err, LockError::OwnershipLost));
    }
}
