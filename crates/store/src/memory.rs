use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tollgate_common::{TollgateError, TollgateResult};
use tracing::{debug, trace};

use crate::clock::{add_std, Clock, SystemClock};
use crate::{new_lock_token, KvStore, LockAttempt, LockHandle, LockManager};

/// How often a waiting acquirer re-checks a lock whose lease may have run out.
const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Run `sweep` against `target` every `every` until `target` is dropped.
fn spawn_sweeper<T>(
    target: &Arc<T>,
    every: Duration,
    what: &'static str,
    sweep: fn(&T) -> usize,
) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
{
    let target: Weak<T> = Arc::downgrade(target);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(target) = target.upgrade() else {
                debug!(what, "owner dropped, cleanup task exiting");
                break;
            };
            let removed = sweep(&target);
            trace!(what, removed, "cleanup tick completed");
        }
    })
}

struct StoredValue {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// In-process [`KvStore`] with TTL semantics driven by a [`Clock`].
///
/// Expired entries are dropped lazily on access, by [`cleanup`](Self::cleanup),
/// and periodically once [`start_cleanup_task`](Self::start_cleanup_task) runs.
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.entries.get(key).map_or(false, |e| !e.is_expired(now))
    }

    /// Entries held in memory, including expired ones not yet swept.
    pub fn raw_len(&self) -> usize {
        self.entries.len()
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_key, entry| !entry.is_expired(now));
        let remaining = self.entries.len();
        let removed = before.saturating_sub(remaining);
        debug!(removed, remaining, "memory store cleanup complete");
        removed
    }

    /// Sweep expired entries every `every`. Keys that are never read again,
    /// such as per-nonce counters, are only reclaimed this way.
    ///
    /// The task holds a weak reference and stops once the store is dropped.
    pub fn start_cleanup_task(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        spawn_sweeper(self, every, "memory store", Self::cleanup)
    }

    fn evict_if_expired(&self, key: &str, now: DateTime<Utc>) {
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> TollgateResult<Option<String>> {
        let now = self.clock.now();
        self.evict_if_expired(key, now);
        Ok(self.entries.get(key).map(|e| e.value.clone()))
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> TollgateResult<()> {
        let now = self.clock.now();
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: Some(add_std(now, ttl)),
            },
        );
        Ok(())
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> TollgateResult<u64> {
        let now = self.clock.now();
        let fresh = || StoredValue {
            value: "0".to_string(),
            expires_at: Some(add_std(now, ttl)),
        };

        let mut entry = self.entries.entry(key.to_string()).or_insert_with(fresh);
        if entry.is_expired(now) {
            *entry = fresh();
        }

        let count = entry
            .value
            .parse::<u64>()
            .map_err(|_| TollgateError::Store(format!("value at {} is not a counter", key)))?
            + 1;
        entry.value = count.to_string();
        if entry.expires_at.is_none() {
            entry.expires_at = Some(add_std(now, ttl));
        }

        trace!(key, count, "counter incremented");
        Ok(count)
    }

    async fn ttl(&self, key: &str) -> TollgateResult<Option<Duration>> {
        let now = self.clock.now();
        self.evict_if_expired(key, now);
        Ok(self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .and_then(|at| (at - now).to_std().ok()))
    }

    async fn now(&self) -> TollgateResult<DateTime<Utc>> {
        Ok(self.clock.now())
    }
}

struct Lease {
    token: String,
    expires_at: DateTime<Utc>,
}

/// In-process [`LockManager`].
///
/// Waiters are woken on every release and additionally poll so that a lease
/// which simply runs out is noticed without a release.
pub struct MemoryLockManager {
    leases: DashMap<String, Lease>,
    released: Notify,
    clock: Arc<dyn Clock>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: DashMap::new(),
            released: Notify::new(),
            clock,
        }
    }

    /// Number of leases that are currently held.
    pub fn held_count(&self) -> usize {
        let now = self.clock.now();
        self.leases.iter().filter(|l| l.expires_at > now).count()
    }

    /// Leases held in memory, including lapsed ones not yet swept.
    pub fn raw_len(&self) -> usize {
        self.leases.len()
    }

    /// Drop leases that ran out without being released. Returns how many.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let before = self.leases.len();
        self.leases.retain(|_key, lease| lease.expires_at > now);
        let removed = before.saturating_sub(self.leases.len());
        if removed > 0 {
            debug!(removed, "lapsed leases swept");
        }
        removed
    }

    /// Sweep lapsed leases every `every` until the manager is dropped.
    pub fn start_cleanup_task(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        spawn_sweeper(self, every, "memory locks", Self::cleanup)
    }

    fn try_take(&self, key: &str, token: &str, lease: Duration) -> bool {
        let now = self.clock.now();
        let grant = || Lease {
            token: token.to_string(),
            expires_at: add_std(now, lease),
        };

        match self.leases.entry(key.to_string()) {
            MapEntry::Vacant(slot) => {
                slot.insert(grant());
                true
            }
            MapEntry::Occupied(mut slot) => {
                if slot.get().expires_at <= now {
                    debug!(key, "taking over lapsed lease");
                    slot.insert(grant());
                    true
                } else {
                    false
                }
            }
        }
    }
}

impl Default for MemoryLockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(&self, key: &str, wait: Duration, lease: Duration) -> TollgateResult<LockAttempt> {
        let token = new_lock_token();

        let contend = async {
            loop {
                let notified = self.released.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.try_take(key, &token, lease) {
                    return;
                }

                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(LEASE_POLL_INTERVAL) => {}
                }
            }
        };

        // try_take is synchronous, so cancellation can never strand a lease.
        match tokio::time::timeout(wait, contend).await {
            Ok(()) => Ok(LockAttempt::Acquired(LockHandle::new(key, token, wait, lease))),
            Err(_) => {
                debug!(key, ?wait, "lock wait timed out");
                Ok(LockAttempt::TimedOut)
            }
        }
    }

    async fn release(&self, handle: LockHandle) -> TollgateResult<bool> {
        let removed = self
            .leases
            .remove_if(handle.key(), |_, lease| lease.token == handle.token())
            .is_some();
        if removed {
            self.released.notify_waiters();
        }
        Ok(removed)
    }

    async fn is_locked(&self, key: &str) -> TollgateResult<bool> {
        let now = self.clock.now();
        Ok(self.leases.get(key).map_or(false, |l| l.expires_at > now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;
    use chrono::TimeZone;

    fn manual() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 4, 23, 10, 0, 0).unwrap(),
        ))
    }

    #[tokio::test]
    async fn values_expire_with_the_clock() {
        let clock = manual();
        let store = MemoryStore::with_clock(clock.clone());

        store.set_with_expiry("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.ttl("k").await.unwrap(), Some(Duration::from_secs(10)));

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.ttl("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn counter_sets_ttl_only_on_creation() {
        let clock = manual();
        let store = MemoryStore::with_clock(clock.clone());
        let window = Duration::from_secs(5);

        assert_eq!(store.incr_with_expiry("c", window).await.unwrap(), 1);
        clock.advance(Duration::from_secs(3));
        assert_eq!(store.incr_with_expiry("c", window).await.unwrap(), 2);
        // The second increment must not have pushed the expiry out.
        assert_eq!(store.ttl("c").await.unwrap(), Some(Duration::from_secs(2)));

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.incr_with_expiry("c", window).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn counter_rejects_non_numeric_value() {
        let store = MemoryStore::new();
        store.set_with_expiry("c", "abc", Duration::from_secs(5)).await.unwrap();
        let err = store.incr_with_expiry("c", Duration::from_secs(5)).await.unwrap_err();
        assert!(err.is_store_failure());
    }

    #[tokio::test]
    async fn cleanup_removes_expired_entries() {
        let clock = manual();
        let store = MemoryStore::with_clock(clock.clone());
        store.set_with_expiry("short", "1", Duration::from_secs(1)).await.unwrap();
        store.set_with_expiry("long", "1", Duration::from_secs(60)).await.unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.cleanup(), 1);

        assert!(!store.contains_key("short"));
        assert!(store.contains_key("long"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn unread_counters_are_reclaimed_by_cleanup_task() {
        let clock = manual();
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));

        for i in 0..10_000 {
            store
                .incr_with_expiry(&format!("rate:nonce:1.1.1.1:/pay:{}", i), Duration::from_secs(60))
                .await
                .unwrap();
        }
        clock.advance(Duration::from_secs(3_600));
        assert_eq!(store.len(), 0);
        assert_eq!(store.raw_len(), 10_000);

        let task = store.start_cleanup_task(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.raw_len(), 0);

        drop(store);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("cleanup task should stop with its store")
            .unwrap();
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let locks = MemoryLockManager::new();
        let wait = Duration::from_millis(50);
        let lease = Duration::from_secs(30);

        let first = match locks.acquire("res", wait, lease).await.unwrap() {
            LockAttempt::Acquired(handle) => handle,
            LockAttempt::TimedOut => panic!("first acquire should succeed"),
        };
        assert!(locks.is_locked("res").await.unwrap());
        assert!(matches!(
            locks.acquire("res", wait, lease).await.unwrap(),
            LockAttempt::TimedOut
        ));

        assert!(locks.release(first).await.unwrap());
        assert!(!locks.is_locked("res").await.unwrap());
        assert!(matches!(
            locks.acquire("res", wait, lease).await.unwrap(),
            LockAttempt::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn waiter_is_woken_by_release() {
        let locks = Arc::new(MemoryLockManager::new());
        let lease = Duration::from_secs(30);

        let held = match locks.acquire("res", Duration::from_millis(10), lease).await.unwrap() {
            LockAttempt::Acquired(handle) => handle,
            LockAttempt::TimedOut => panic!("should acquire"),
        };

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("res", Duration::from_secs(5), lease).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        locks.release(held).await.unwrap();

        let attempt = waiter.await.unwrap().unwrap();
        assert!(matches!(attempt, LockAttempt::Acquired(_)));
    }

    #[tokio::test]
    async fn lapsed_lease_can_be_taken_over() {
        let clock = manual();
        let locks = MemoryLockManager::with_clock(clock.clone());
        let wait = Duration::from_millis(50);

        let stale = match locks.acquire("res", wait, Duration::from_secs(30)).await.unwrap() {
            LockAttempt::Acquired(handle) => handle,
            LockAttempt::TimedOut => panic!("should acquire"),
        };

        clock.advance(Duration::from_secs(31));
        assert!(!locks.is_locked("res").await.unwrap());

        let current = match locks.acquire("res", wait, Duration::from_secs(30)).await.unwrap() {
            LockAttempt::Acquired(handle) => handle,
            LockAttempt::TimedOut => panic!("lapsed lease should be reclaimable"),
        };

        // The stale holder must not free the new holder's lock.
        assert!(!locks.release(stale).await.unwrap());
        assert!(locks.is_locked("res").await.unwrap());
        assert!(locks.release(current).await.unwrap());
        assert_eq!(locks.held_count(), 0);
    }

    #[tokio::test]
    async fn lapsed_leases_are_swept() {
        let clock = manual();
        let locks = Arc::new(MemoryLockManager::with_clock(clock.clone()));
        let wait = Duration::from_millis(50);

        for key in ["a", "b", "c"] {
            let attempt = locks.acquire(key, wait, Duration::from_secs(30)).await.unwrap();
            assert!(matches!(attempt, LockAttempt::Acquired(_)));
        }
        let attempt = locks.acquire("d", wait, Duration::from_secs(300)).await.unwrap();
        assert!(matches!(attempt, LockAttempt::Acquired(_)));

        clock.advance(Duration::from_secs(60));
        assert_eq!(locks.held_count(), 1);
        assert_eq!(locks.raw_len(), 4);

        let _task = locks.start_cleanup_task(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(locks.raw_len(), 1);
        assert!(locks.is_locked("d").await.unwrap());
    }
}
