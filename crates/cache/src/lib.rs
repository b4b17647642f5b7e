//! Stampede-safe memoization of expensive derived values.
//!
//! [`StampedeCache::resolve`] is a cache-aside read guarded by a distributed
//! lock: readers that miss at the same moment queue on one lock, the first
//! one through asks the [`ResourceProvider`], and the rest find its result
//! on their re-read. Every value is cached for its requested validity minus
//! a safety margin, so a cached value always outlives the entry that hands
//! it out.

pub mod metrics;
pub mod provider;
pub mod signer;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tollgate_common::{CacheConfig, Keys, TollgateError, TollgateResult};
use tollgate_store::{KvStore, LockAttempt, LockHandle, LockManager};
use tracing::{debug, error, info, warn};

pub use metrics::CacheMetrics;
pub use provider::{
    MemoryMetadataSource, MetadataSource, ResourceMetadata, ResourceProvider, SignedUrlProvider,
};
pub use signer::{UrlSigner, VerifyError};

/// Timing knobs for [`StampedeCache`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheSettings {
    pub lock_wait: Duration,
    pub lock_lease: Duration,
    pub safety_margin: Duration,
    pub default_validity: Duration,
    pub latency_alarm_ratio: f64,
}

impl From<&CacheConfig> for CacheSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            lock_wait: config.lock_wait(),
            lock_lease: config.lock_lease(),
            safety_margin: config.safety_margin(),
            default_validity: config.default_validity(),
            latency_alarm_ratio: config.latency_alarm_ratio,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl CacheSettings {
    /// How long a value requested for `validity` may stay cached.
    /// `None` when the margin leaves nothing to cache.
    pub fn cache_ttl(&self, validity: Duration) -> Option<Duration> {
        validity
            .checked_sub(self.safety_margin)
            .filter(|ttl| !ttl.is_zero())
    }

    /// Materialization time worth a warning. `None` when the margin is zero.
    fn latency_alarm(&self) -> Option<Duration> {
        let threshold = self
            .safety_margin
            .mul_f64(self.latency_alarm_ratio.clamp(0.0, 1.0));
        (!threshold.is_zero()).then_some(threshold)
    }
}

/// A granted lock that is released even if the resolving future is dropped
/// mid-materialization. An explicit [`release`](Self::release) is the normal
/// path; otherwise `Drop` hands the release to the runtime.
struct LockGuard {
    locks: Arc<dyn LockManager>,
    handle: Option<LockHandle>,
}

impl LockGuard {
    fn new(locks: Arc<dyn LockManager>, handle: LockHandle) -> Self {
        Self {
            locks,
            handle: Some(handle),
        }
    }

    fn handle(&self) -> &LockHandle {
        self.handle
            .as_ref()
            .expect("lock handle is only taken when the guard is consumed")
    }

    async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            release_lock(self.locks.as_ref(), handle).await;
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(
                    lock_key = handle.key(),
                    "materialization cancelled, releasing lock in background"
                );
                let locks = self.locks.clone();
                runtime.spawn(async move { release_lock(locks.as_ref(), handle).await });
            }
            Err(_) => warn!(
                lock_key = handle.key(),
                "materialization cancelled outside a runtime, relying on lease expiry"
            ),
        }
    }
}

async fn release_lock(locks: &dyn LockManager, handle: LockHandle) {
    let lock_key = handle.key().to_string();
    match locks.release(handle).await {
        Ok(true) => {}
        Ok(false) => error!(lock_key = %lock_key, "lock was no longer ours at release"),
        Err(e) => error!(lock_key = %lock_key, error = %e, "failed to release lock, relying on lease expiry"),
    }
}

pub struct StampedeCache {
    store: Arc<dyn KvStore>,
    locks: Arc<dyn LockManager>,
    provider: Arc<dyn ResourceProvider>,
    keys: Keys,
    settings: CacheSettings,
    metrics: Option<CacheMetrics>,
}

impl StampedeCache {
    pub fn new(
        store: Arc<dyn KvStore>,
        locks: Arc<dyn LockManager>,
        provider: Arc<dyn ResourceProvider>,
        keys: Keys,
        settings: CacheSettings,
    ) -> Self {
        info!(
            lock_wait = ?settings.lock_wait,
            lock_lease = ?settings.lock_lease,
            safety_margin = ?settings.safety_margin,
            "creating stampede cache"
        );
        Self {
            store,
            locks,
            provider,
            keys,
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: CacheMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Resolve with the configured default validity.
    pub async fn resolve_default(&self, resource_key: &str) -> TollgateResult<String> {
        self.resolve(resource_key, self.settings.default_validity).await
    }

    /// Return the cached value for `(resource_key, validity)`, materializing
    /// it at most once across all callers that miss concurrently.
    pub async fn resolve(&self, resource_key: &str, validity: Duration) -> TollgateResult<String> {
        if resource_key.trim().is_empty() {
            return Err(TollgateError::InvalidResourceKey);
        }

        let cache_key = self.keys.presigned_url(resource_key, validity);
        if let Some(value) = self.store.get(&cache_key).await? {
            debug!(resource_key, "cache hit");
            self.count(|m| &m.hits);
            return Ok(value);
        }
        self.count(|m| &m.misses);

        let lock_key = self.keys.presigned_url_lock(resource_key, validity);
        let guard = match self
            .locks
            .acquire(&lock_key, self.settings.lock_wait, self.settings.lock_lease)
            .await?
        {
            LockAttempt::Acquired(handle) => LockGuard::new(self.locks.clone(), handle),
            LockAttempt::TimedOut => {
                warn!(resource_key, lock_key = %lock_key, wait = ?self.settings.lock_wait, "gave up waiting for materialization lock");
                self.count(|m| &m.lock_timeouts);
                return Err(TollgateError::LockTimeout {
                    key: lock_key,
                    waited: self.settings.lock_wait,
                });
            }
        };

        let result = self
            .fill(resource_key, validity, &cache_key, guard.handle())
            .await;
        guard.release().await;
        result
    }

    /// The part of [`resolve`](Self::resolve) that runs under the lock.
    async fn fill(
        &self,
        resource_key: &str,
        validity: Duration,
        cache_key: &str,
        handle: &LockHandle,
    ) -> TollgateResult<String> {
        if let Some(value) = self.store.get(cache_key).await? {
            debug!(resource_key, "populated while waiting for lock");
            return Ok(value);
        }

        let started = Instant::now();
        let Some(metadata) = self.provider.metadata(resource_key).await? else {
            info!(resource_key, "resource not found");
            return Err(TollgateError::ResourceNotFound(resource_key.to_string()));
        };
        let value = self
            .provider
            .access_url(resource_key, &metadata, validity)
            .await?;
        let elapsed = started.elapsed();

        if let Some(metrics) = &self.metrics {
            metrics.materializations.inc();
            metrics.materialize_duration.observe(elapsed.as_secs_f64());
        }
        self.check_latency(resource_key, elapsed, handle);

        match self.settings.cache_ttl(validity) {
            Some(ttl) => {
                self.store.set_with_expiry(cache_key, &value, ttl).await?;
                debug!(resource_key, ?ttl, ?elapsed, "materialized and cached");
            }
            None => warn!(
                resource_key,
                ?validity,
                safety_margin = ?self.settings.safety_margin,
                "validity does not exceed safety margin, value not cached"
            ),
        }
        Ok(value)
    }

    fn check_latency(&self, resource_key: &str, elapsed: Duration, handle: &LockHandle) {
        if handle.lease_elapsed() {
            error!(
                resource_key,
                lock_key = handle.key(),
                ?elapsed,
                lease = ?handle.lease(),
                "lock lease elapsed during materialization; a concurrent caller may have materialized too"
            );
        } else if self
            .settings
            .latency_alarm()
            .map_or(false, |alarm| elapsed >= alarm)
        {
            warn!(
                resource_key,
                ?elapsed,
                safety_margin = ?self.settings.safety_margin,
                "slow materialization is eating into the safety margin"
            );
        }
    }

    fn count(&self, counter: impl FnOnce(&CacheMetrics) -> &prometheus::IntCounter) {
        if let Some(metrics) = &self.metrics {
            counter(metrics).inc();
        }
    }
}
