use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tollgate_cache::{CacheSettings, ResourceMetadata, ResourceProvider, StampedeCache};
use tollgate_common::{Keys, TollgateError, TollgateResult};
use tollgate_store::{LockAttempt, LockManager, MemoryLockManager, MemoryStore};

/// Provider slow enough that concurrent misses overlap.
struct SlowUpstream {
    calls: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl ResourceProvider for SlowUpstream {
    async fn metadata(&self, _key: &str) -> TollgateResult<Option<ResourceMetadata>> {
        Ok(Some(ResourceMetadata::new(42, "image/png")))
    }

    async fn access_url(
        &self,
        key: &str,
        _metadata: &ResourceMetadata,
        _validity: Duration,
    ) -> TollgateResult<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.delay).await;
        Ok(format!("https://cdn/{}#{}", key, n))
    }
}

fn cache_with(lock_wait: Duration) -> (Arc<StampedeCache>, Arc<MemoryLockManager>, Arc<SlowUpstream>) {
    let upstream = Arc::new(SlowUpstream {
        calls: AtomicUsize::new(0),
        delay: Duration::from_millis(50),
    });
    let locks = Arc::new(MemoryLockManager::new());
    let settings = CacheSettings {
        lock_wait,
        ..CacheSettings::default()
    };
    let cache = StampedeCache::new(
        Arc::new(MemoryStore::new()),
        locks.clone(),
        upstream.clone(),
        Keys::default(),
        settings,
    );
    (Arc::new(cache), locks, upstream)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_misses_materialize_once() {
    let (cache, locks, upstream) = cache_with(Duration::from_secs(10));

    let tasks: Vec<_> = (0..64)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.resolve("img/cat.png", Duration::from_secs(3600)).await })
        })
        .collect();

    let mut values = Vec::new();
    for task in tasks {
        values.push(task.await.unwrap().unwrap());
    }

    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    assert!(values.iter().all(|v| v == "https://cdn/img/cat.png#1"));
    assert_eq!(locks.held_count(), 0);
}

#[tokio::test]
async fn lock_timeout_is_reported_and_leaves_no_lock() {
    let (cache, locks, upstream) = cache_with(Duration::from_millis(100));
    let validity = Duration::from_secs(3600);
    let lock_key = Keys::default().presigned_url_lock("img/dog.png", validity);

    let LockAttempt::Acquired(holder) = locks
        .acquire(&lock_key, Duration::from_secs(1), Duration::from_secs(60))
        .await
        .unwrap()
    else {
        panic!("lock should be free");
    };

    let err = cache.resolve("img/dog.png", validity).await.unwrap_err();
    match err {
        TollgateError::LockTimeout { key, waited } => {
            assert_eq!(key, lock_key);
            assert_eq!(waited, Duration::from_millis(100));
        }
        other => panic!("expected LockTimeout, got {:?}", other),
    }
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    assert_eq!(locks.held_count(), 1);

    assert!(locks.release(holder).await.unwrap());
    assert!(!locks.is_locked(&lock_key).await.unwrap());
}

#[tokio::test]
async fn other_validity_does_not_wait_on_held_lock() {
    let (cache, locks, _upstream) = cache_with(Duration::from_millis(100));
    let hour_lock = Keys::default().presigned_url_lock("img/fox.png", Duration::from_secs(3600));

    let LockAttempt::Acquired(_holder) = locks
        .acquire(&hour_lock, Duration::from_secs(1), Duration::from_secs(60))
        .await
        .unwrap()
    else {
        panic!("lock should be free");
    };

    let value = cache
        .resolve("img/fox.png", Duration::from_secs(86_400))
        .await
        .unwrap();
    assert!(value.starts_with("https://cdn/img/fox.png"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiters_see_value_written_by_first_caller() {
    let (cache, _locks, upstream) = cache_with(Duration::from_secs(10));

    let first = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.resolve("a", Duration::from_secs(600)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = cache.resolve("a", Duration::from_secs(600)).await.unwrap();

    assert_eq!(first.await.unwrap().unwrap(), second);
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancelled_resolve_releases_its_lock() {
    let (cache, locks, upstream) = cache_with(Duration::from_millis(200));
    let validity = Duration::from_secs(3600);

    let task = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.resolve("img/cat.png", validity).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    assert_eq!(locks.held_count(), 1);

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(locks.held_count(), 0);

    let value = cache.resolve("img/cat.png", validity).await.unwrap();
    assert_eq!(value, "https://cdn/img/cat.png#2");
}
