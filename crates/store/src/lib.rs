//! Shared coordination primitives for tollgate.
//!
//! Everything tollgate enforces across instances lives behind two traits:
//!
//! - [`KvStore`] -- a TTL-capable key/value store that also serves as the
//!   authoritative clock, so window and day boundaries agree across
//!   instances.
//! - [`LockManager`] -- named, lease-based mutual exclusion with a bounded
//!   wait to acquire. A lease that is never released expires on its own.
//!
//! Two backends are provided: [`memory`] (single process, driven by an
//! injectable [`Clock`]) and [`redis_store`]. Wrap either in [`Deadline`] to
//! bound every round trip.

pub mod clock;
pub mod deadline;
pub mod memory;
pub mod redis_store;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tollgate_common::TollgateResult;

pub use clock::{Clock, ManualClock, SystemClock};
pub use deadline::Deadline;
pub use memory::{MemoryLockManager, MemoryStore};
pub use redis_store::{RedisLockManager, RedisStore};

/// Key/value store shared by every instance.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> TollgateResult<Option<String>>;

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> TollgateResult<()>;

    /// Atomically increment the counter at `key`, setting its expiry to `ttl`
    /// only when the increment created it. Returns the post-increment count.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> TollgateResult<u64>;

    /// Remaining time to live, or `None` if the key is absent or never expires.
    async fn ttl(&self, key: &str) -> TollgateResult<Option<Duration>>;

    /// Current time according to the store.
    async fn now(&self) -> TollgateResult<DateTime<Utc>>;
}

/// A granted lock. Owned by the caller until handed back to
/// [`LockManager::release`].
#[derive(Debug)]
pub struct LockHandle {
    key: String,
    token: String,
    wait: Duration,
    lease: Duration,
    acquired_at: Instant,
}

impl LockHandle {
    pub fn new(key: impl Into<String>, token: impl Into<String>, wait: Duration, lease: Duration) -> Self {
        Self {
            key: key.into(),
            token: token.into(),
            wait,
            lease,
            acquired_at: Instant::now(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Owner token; release only succeeds while the lock still carries it.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// True once the lease may have been granted to someone else.
    pub fn lease_elapsed(&self) -> bool {
        self.held_for() >= self.lease
    }
}

/// Outcome of a bounded lock acquisition.
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(LockHandle),
    TimedOut,
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Try to take `key` for `lease`, waiting at most `wait`. Never leaves
    /// the lock held when it returns [`LockAttempt::TimedOut`].
    async fn acquire(&self, key: &str, wait: Duration, lease: Duration) -> TollgateResult<LockAttempt>;

    /// Release a held lock. Returns `false` when the lease had already
    /// lapsed and the lock belongs to nobody or to another holder.
    async fn release(&self, handle: LockHandle) -> TollgateResult<bool>;

    async fn is_locked(&self, key: &str) -> TollgateResult<bool>;
}

#[async_trait]
impl<T: KvStore + ?Sized> KvStore for Arc<T> {
    async fn get(&self, key: &str) -> TollgateResult<Option<String>> {
        (**self).get(key).await
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> TollgateResult<()> {
        (**self).set_with_expiry(key, value, ttl).await
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> TollgateResult<u64> {
        (**self).incr_with_expiry(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> TollgateResult<Option<Duration>> {
        (**self).ttl(key).await
    }

    async fn now(&self) -> TollgateResult<DateTime<Utc>> {
        (**self).now().await
    }
}

#[async_trait]
impl<T: LockManager + ?Sized> LockManager for Arc<T> {
    async fn acquire(&self, key: &str, wait: Duration, lease: Duration) -> TollgateResult<LockAttempt> {
        (**self).acquire(key, wait, lease).await
    }

    async fn release(&self, handle: LockHandle) -> TollgateResult<bool> {
        (**self).release(handle).await
    }

    async fn is_locked(&self, key: &str) -> TollgateResult<bool> {
        (**self).is_locked(key).await
    }
}

/// Random owner token for a new lock.
pub(crate) fn new_lock_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
