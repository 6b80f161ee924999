//! Lease-based mutual exclusion over a channel's change-feed cursor.
//!
//! The lease is an external record, not an in-process mutex: acquiring it is
//! one conditional write against the shared store, so any number of
//! stateless invocations in any number of processes can contend for it.
//! A holder that crashes simply stops renewing; once `lock_expires_at`
//! passes, the next acquirer reclaims the lease and resumes from the last
//! released cursor.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::now;
use crate::store::LeaseStore;

/// Default grant in seconds. Must exceed the worst-case time to page one batch.
pub const DEFAULT_LEASE_SECS: i64 = 30;

/// Acquire/release front-end over a [`LeaseStore`].
#[derive(Clone)]
pub struct LeaseLock {
    store: Arc<dyn LeaseStore>,
    duration: Duration,
}

/// Proof of a successful acquire.
///
/// Carries the cursor stored at acquire time and the expiry this holder was
/// granted, which fences the matching release. Dropping a guard without
/// releasing it leaves the lease held until it expires.
#[derive(Debug)]
pub struct LeaseGuard {
    channel_id: String,
    cursor: String,
    granted_until: DateTime<Utc>,
    released: bool,
}

impl LeaseGuard {
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Cursor the previous holder released (or the seeded one).
    pub fn cursor(&self) -> &str {
        &self.cursor
    }

    pub fn granted_until(&self) -> DateTime<Utc> {
        self.granted_until
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                channel_id = %self.channel_id,
                expires_at = %self.granted_until,
                "lease not released; it stays held until expiry"
            );
        }
    }
}

impl LeaseLock {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self::with_duration(store, Duration::seconds(DEFAULT_LEASE_SECS))
    }

    pub fn with_duration(store: Arc<dyn LeaseStore>, duration: Duration) -> Self {
        Self { store, duration }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Take the lease for `channel_id`.
    ///
    /// One round-trip to the store; never waits or retries. Fails with
    /// `LockHeld` while another holder's grant is live.
    pub async fn acquire(&self, channel_id: &str) -> Result<LeaseGuard> {
        let at = now();
        let until = at + self.duration;
        let cursor = self.store.acquire_lease(channel_id, at, until).await?;
        debug!(channel_id, %until, "lease acquired");
        Ok(LeaseGuard {
            channel_id: channel_id.to_string(),
            cursor,
            granted_until: until,
            released: false,
        })
    }

    /// Unlock the lease and store `new_cursor` as the next resume point.
    pub async fn release(&self, mut guard: LeaseGuard, new_cursor: &str) -> Result<()> {
        guard.released = true;
        self.store
            .release_lease(&guard.channel_id, guard.granted_until, new_cursor)
            .await?;
        debug!(channel_id = %guard.channel_id, cursor = new_cursor, "lease released");
        Ok(())
    }

    /// Give up the guard without touching the store. The lease self-expires.
    pub fn abandon(&self, mut guard: LeaseGuard) {
        guard.released = true;
        debug!(channel_id = %guard.channel_id, "lease abandoned until expiry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoordError;
    use crate::models::Lease;
    use crate::store::memory::InMemoryStore;

    fn seeded(cursor: &str) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store
            .put_lease(Lease {
                channel_id: "F1".into(),
                cursor: cursor.into(),
                locked: false,
                lock_expires_at: now(),
            })
            .unwrap();
        store
    }

    #[tokio::test]
    async fn acquire_returns_stored_cursor() {
        let store = seeded("C0");
        let lock = LeaseLock::new(store.clone());
        let guard = lock.acquire("F1").await.unwrap();
        assert_eq!(guard.cursor(), "C0");

        let lease = store.get_lease("F1").await.unwrap().unwrap();
        assert!(lease.locked);
        assert_eq!(lease.lock_expires_at, guard.granted_until());
        lock.release(guard, "C1").await.unwrap();
    }

    #[tokio::test]
    async fn second_acquire_before_release_is_rejected() {
        let lock = LeaseLock::new(seeded("C0"));
        let guard = lock.acquire("F1").await.unwrap();
        let err = lock.acquire("F1").await.unwrap_err();
        assert!(err.is_lock_held());
        lock.release(guard, "C0").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_never_both_succeed() {
        let lock = LeaseLock::new(seeded("C0"));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            handles.push(tokio::spawn(async move { lock.acquire("F1").await }));
        }
        let mut winners = Vec::new();
        for h in handles {
            if let Ok(guard) = h.await.unwrap() {
                winners.push(guard);
            }
        }
        assert_eq!(winners.len(), 1);
        let guard = winners.pop().unwrap();
        lock.release(guard, "C0").await.unwrap();
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_even_though_locked() {
        let store = seeded("C0");
        store
            .put_lease(Lease {
                channel_id: "F1".into(),
                cursor: "C7".into(),
                locked: true,
                lock_expires_at: now() - Duration::seconds(5),
            })
            .unwrap();

        let lock = LeaseLock::new(store.clone());
        let guard = lock.acquire("F1").await.unwrap();
        assert_eq!(guard.cursor(), "C7");
        lock.release(guard, "C8").await.unwrap();

        let lease = store.get_lease("F1").await.unwrap().unwrap();
        assert!(!lease.locked);
        assert_eq!(lease.cursor, "C8");
    }

    #[tokio::test]
    async fn release_after_reclaim_reports_lease_lost() {
        let store = seeded("C0");
        let short = LeaseLock::with_duration(store.clone(), Duration::milliseconds(1));
        let stale = short.acquire("F1").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let lock = LeaseLock::new(store.clone());
        let fresh = lock.acquire("F1").await.unwrap();

        let err = short.release(stale, "STALE").await.unwrap_err();
        assert!(matches!(err, CoordError::LeaseLost(_)));

        lock.release(fresh, "C2").await.unwrap();
        let lease = store.get_lease("F1").await.unwrap().unwrap();
        assert_eq!(lease.cursor, "C2");
    }

    #[tokio::test]
    async fn unseeded_channel_is_reported_missing() {
        let lock = LeaseLock::new(Arc::new(InMemoryStore::new()));
        let err = lock.acquire("nope").await.unwrap_err();
        assert!(matches!(err, CoordError::LeaseMissing(_)));
    }
}
