use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tollgate_common::{TollgateError, TollgateResult};
use tracing::warn;

use crate::{KvStore, LockAttempt, LockHandle, LockManager};

/// Bounds every call on the wrapped store or lock manager.
///
/// Lock acquisition is allowed its own wait bound plus the deadline.
#[derive(Debug, Clone)]
pub struct Deadline<S> {
    inner: S,
    timeout: Duration,
}

impl<S> Deadline<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        assert!(timeout > Duration::ZERO, "store deadline must be non-zero");
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn bounded<T, F>(&self, operation: &'static str, limit: Duration, fut: F) -> TollgateResult<T>
    where
        T: Send,
        F: Future<Output = TollgateResult<T>> + Send,
    {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout = ?limit, "store call exceeded deadline");
                Err(TollgateError::StoreTimeout {
                    operation,
                    timeout: limit,
                })
            }
        }
    }
}

#[async_trait]
impl<S: KvStore> KvStore for Deadline<S> {
    async fn get(&self, key: &str) -> TollgateResult<Option<String>> {
        self.bounded("get", self.timeout, self.inner.get(key)).await
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> TollgateResult<()> {
        self.bounded("set_with_expiry", self.timeout, self.inner.set_with_expiry(key, value, ttl))
            .await
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> TollgateResult<u64> {
        self.bounded("incr_with_expiry", self.timeout, self.inner.incr_with_expiry(key, ttl))
            .await
    }

    async fn ttl(&self, key: &str) -> TollgateResult<Option<Duration>> {
        self.bounded("ttl", self.timeout, self.inner.ttl(key)).await
    }

    async fn now(&self) -> TollgateResult<DateTime<Utc>> {
        self.bounded("now", self.timeout, self.inner.now()).await
    }
}

#[async_trait]
impl<S: LockManager> LockManager for Deadline<S> {
    async fn acquire(&self, key: &str, wait: Duration, lease: Duration) -> TollgateResult<LockAttempt> {
        let limit = wait.saturating_add(self.timeout);
        self.bounded("acquire", limit, self.inner.acquire(key, wait, lease)).await
    }

    async fn release(&self, handle: LockHandle) -> TollgateResult<bool> {
        self.bounded("release", self.timeout, self.inner.release(handle)).await
    }

    async fn is_locked(&self, key: &str) -> TollgateResult<bool> {
        self.bounded("is_locked", self.timeout, self.inner.is_locked(key)).await
    }
}
