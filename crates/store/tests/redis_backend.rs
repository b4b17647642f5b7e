//! Behaviour of the Redis backend against a live server.
//!
//! Run with `REDIS_URL=redis://host:port cargo test -p tollgate-store -- --ignored`.

use std::time::Duration;

use chrono::Utc;
use tollgate_store::{KvStore, LockAttempt, LockHandle, LockManager, RedisLockManager, RedisStore};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Keys are unique per run so tests never see each other's state.
fn unique(name: &str) -> String {
    format!("tollgate-test:{}:{}", name, uuid::Uuid::new_v4())
}

fn store() -> RedisStore {
    RedisStore::open(&redis_url()).unwrap()
}

fn locks() -> RedisLockManager {
    RedisLockManager::open(&redis_url()).unwrap()
}

async fn acquired(locks: &RedisLockManager, key: &str, wait: Duration, lease: Duration) -> LockHandle {
    match locks.acquire(key, wait, lease).await.unwrap() {
        LockAttempt::Acquired(handle) => handle,
        LockAttempt::TimedOut => panic!("lock {} should be free", key),
    }
}

#[tokio::test]
#[ignore = "needs a redis server at REDIS_URL"]
async fn counter_expiry_is_set_only_on_creation() {
    let store = store();
    let key = unique("incr");

    assert_eq!(store.incr_with_expiry(&key, Duration::from_secs(10)).await.unwrap(), 1);
    assert_eq!(store.incr_with_expiry(&key, Duration::from_secs(100)).await.unwrap(), 2);

    let ttl = store.ttl(&key).await.unwrap().unwrap();
    assert!(ttl <= Duration::from_secs(10), "ttl was extended to {:?}", ttl);
    assert!(ttl > Duration::from_secs(8));
}

#[tokio::test]
#[ignore = "needs a redis server at REDIS_URL"]
async fn counter_restarts_after_window() {
    let store = store();
    let key = unique("window");
    let window = Duration::from_millis(200);

    assert_eq!(store.incr_with_expiry(&key, window).await.unwrap(), 1);
    assert_eq!(store.incr_with_expiry(&key, window).await.unwrap(), 2);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.incr_with_expiry(&key, window).await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "needs a redis server at REDIS_URL"]
async fn counter_without_expiry_gets_one() {
    let store = store();
    let key = unique("persistent");

    let client = redis::Client::open(redis_url()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let _: () = redis::cmd("SET").arg(&key).arg(5).query_async(&mut conn).await.unwrap();
    assert_eq!(store.ttl(&key).await.unwrap(), None);

    assert_eq!(store.incr_with_expiry(&key, Duration::from_secs(30)).await.unwrap(), 6);
    assert!(store.ttl(&key).await.unwrap().is_some());
}

#[tokio::test]
#[ignore = "needs a redis server at REDIS_URL"]
async fn values_expire() {
    let store = store();
    let key = unique("value");

    store.set_with_expiry(&key, "v", Duration::from_millis(200)).await.unwrap();
    assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("v"));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.get(&key).await.unwrap(), None);
}

#[tokio::test]
#[ignore = "needs a redis server at REDIS_URL"]
async fn store_time_tracks_wall_clock() {
    let skew = store().now().await.unwrap() - Utc::now();
    assert!(skew.num_seconds().abs() < 5, "redis clock skew {:?}", skew);
}

#[tokio::test]
#[ignore = "needs a redis server at REDIS_URL"]
async fn only_the_owner_releases() {
    let locks = locks();
    let key = unique("lock");
    let wait = Duration::from_millis(200);

    let stale = acquired(&locks, &key, wait, Duration::from_millis(200)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!locks.is_locked(&key).await.unwrap());

    let current = acquired(&locks, &key, wait, Duration::from_secs(30)).await;
    assert!(!locks.release(stale).await.unwrap());
    assert!(locks.is_locked(&key).await.unwrap());

    assert!(locks.release(current).await.unwrap());
    assert!(!locks.is_locked(&key).await.unwrap());
}

#[tokio::test]
#[ignore = "needs a redis server at REDIS_URL"]
async fn timed_out_acquire_leaves_holder_untouched() {
    let locks = locks();
    let key = unique("contended");

    let holder = acquired(&locks, &key, Duration::from_millis(200), Duration::from_secs(30)).await;
    let attempt = locks
        .acquire(&key, Duration::from_millis(150), Duration::from_secs(30))
        .await
        .unwrap();
    assert!(matches!(attempt, LockAttempt::TimedOut));

    // The timeout cleanup only deletes its own token.
    assert!(locks.is_locked(&key).await.unwrap());
    assert!(locks.release(holder).await.unwrap());
    assert!(!locks.is_locked(&key).await.unwrap());
}

#[tokio::test]
#[ignore = "needs a redis server at REDIS_URL"]
async fn waiter_acquires_once_holder_releases() {
    let locks = std::sync::Arc::new(locks());
    let key = unique("handoff");

    let holder = acquired(&locks, &key, Duration::from_millis(200), Duration::from_secs(30)).await;
    let waiter = {
        let locks = locks.clone();
        let key = key.clone();
        tokio::spawn(async move { locks.acquire(&key, Duration::from_secs(2), Duration::from_secs(30)).await })
    };

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(locks.release(holder).await.unwrap());

    let LockAttempt::Acquired(next) = waiter.await.unwrap().unwrap() else {
        panic!("waiter should take the lock after release");
    };
    assert!(locks.release(next).await.unwrap());
}
