//! Redis-backed store and lock manager.
//!
//! ```text
//! get               → GET key
//! set_with_expiry   → SET key value PX ttl
//! incr_with_expiry  → EVAL (INCR, PEXPIRE when the counter was created)
//! ttl               → PTTL key
//! now               → TIME
//! acquire           → SET key token NX PX lease   (polled until wait runs out)
//! release           → EVAL (DEL only if the value is still our token)
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::Script;
use tokio::sync::OnceCell;
use tollgate_common::{TollgateError, TollgateResult};
use tracing::{debug, info, warn};

use crate::{new_lock_token, KvStore, LockAttempt, LockHandle, LockManager};

const INCR_WITH_EXPIRY: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 or redis.call('PTTL', KEYS[1]) == -1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

const RELEASE_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Delay between `SET NX` attempts while waiting for a lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

fn store_err(e: redis::RedisError) -> TollgateError {
    TollgateError::Store(e.to_string())
}

/// Redis rejects a zero PX/PEXPIRE argument.
fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Lazily opened multiplexed connection shared by all calls.
struct Connection {
    client: redis::Client,
    conn: OnceCell<MultiplexedConnection>,
}

impl Connection {
    fn new(client: redis::Client) -> Self {
        Self {
            client,
            conn: OnceCell::new(),
        }
    }

    async fn get(&self) -> TollgateResult<MultiplexedConnection> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map(|conn| {
                        info!("connected to redis");
                        conn
                    })
            })
            .await
            .map_err(store_err)?;
        Ok(conn.clone())
    }
}

/// [`KvStore`] backed by Redis.
pub struct RedisStore {
    conn: Connection,
    incr: Script,
}

impl RedisStore {
    pub fn new(client: redis::Client) -> Self {
        Self {
            conn: Connection::new(client),
            incr: Script::new(INCR_WITH_EXPIRY),
        }
    }

    pub fn open(url: &str) -> TollgateResult<Self> {
        let client = redis::Client::open(url).map_err(store_err)?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> TollgateResult<Option<String>> {
        let mut conn = self.conn.get().await?;
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(value)
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> TollgateResult<()> {
        let mut conn = self.conn.get().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> TollgateResult<u64> {
        let mut conn = self.conn.get().await?;
        let count: u64 = self
            .incr
            .key(key)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(count)
    }

    async fn ttl(&self, key: &str) -> TollgateResult<Option<Duration>> {
        let mut conn = self.conn.get().await?;
        let pttl: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        // -2: missing, -1: no expiry.
        Ok(u64::try_from(pttl).ok().map(Duration::from_millis))
    }

    async fn now(&self) -> TollgateResult<DateTime<Utc>> {
        let mut conn = self.conn.get().await?;
        let (secs, micros): (i64, u32) = redis::cmd("TIME")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        DateTime::from_timestamp(secs, micros.saturating_mul(1_000))
            .ok_or_else(|| TollgateError::Store(format!("redis TIME out of range: {}", secs)))
    }
}

/// [`LockManager`] backed by Redis `SET NX PX` with owner tokens.
pub struct RedisLockManager {
    conn: Connection,
    release: Script,
}

impl RedisLockManager {
    pub fn new(client: redis::Client) -> Self {
        Self {
            conn: Connection::new(client),
            release: Script::new(RELEASE_IF_OWNER),
        }
    }

    pub fn open(url: &str) -> TollgateResult<Self> {
        let client = redis::Client::open(url).map_err(store_err)?;
        Ok(Self::new(client))
    }

    async fn try_take(&self, key: &str, token: &str, lease: Duration) -> TollgateResult<bool> {
        let mut conn = self.conn.get().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(millis(lease))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(reply.is_some())
    }

    async fn release_token(&self, key: &str, token: &str) -> TollgateResult<bool> {
        let mut conn = self.conn.get().await?;
        let deleted: i64 = self
            .release
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(deleted == 1)
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(&self, key: &str, wait: Duration, lease: Duration) -> TollgateResult<LockAttempt> {
        let token = new_lock_token();

        let contend = async {
            loop {
                if self.try_take(key, &token, lease).await? {
                    return Ok::<_, TollgateError>(());
                }
                tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
            }
        };

        match tokio::time::timeout(wait, contend).await {
            Ok(Ok(())) => Ok(LockAttempt::Acquired(LockHandle::new(key, token, wait, lease))),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                // A SET NX may have landed just as the wait ran out; make
                // sure our token does not linger until the lease expires.
                if let Err(e) = self.release_token(key, &token).await {
                    warn!(key, error = %e, "failed to clear lock after wait timeout");
                }
                debug!(key, ?wait, "lock wait timed out");
                Ok(LockAttempt::TimedOut)
            }
        }
    }

    async fn release(&self, handle: LockHandle) -> TollgateResult<bool> {
        self.release_token(handle.key(), handle.token()).await
    }

    async fn is_locked(&self, key: &str) -> TollgateResult<bool> {
        let mut conn = self.conn.get().await?;
        let exists: bool = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(exists)
    }
}
