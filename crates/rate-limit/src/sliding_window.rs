use std::time::Duration;

use tollgate_common::TollgateResult;
use tollgate_store::KvStore;
use tracing::trace;

/// Outcome of counting one request against a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Within the limit; carries the post-increment count.
    Allowed(u64),
    /// Over the limit; carries the post-increment count.
    Exceeded(u64),
    /// The window length is zero, so nothing was counted.
    Disabled,
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, RateLimitResult::Exceeded(_))
    }
}

/// A window counter kept in the shared store.
///
/// The first request in a window creates the counter with a TTL equal to the
/// window length; every later request increments it. When the TTL lapses the
/// store drops the counter and the next request opens a fresh window. The
/// window boundary therefore follows the store's clock, not this process's.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    limit: u64,
    window: Duration,
}

impl SlidingWindow {
    /// * `limit`  - requests admitted per window
    /// * `window` - window length; zero disables counting
    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_disabled(&self) -> bool {
        self.window.is_zero()
    }

    /// Count one request for `key` and compare against the limit.
    pub async fn check(&self, store: &dyn KvStore, key: &str) -> TollgateResult<RateLimitResult> {
        if self.is_disabled() {
            return Ok(RateLimitResult::Disabled);
        }

        let count = store.incr_with_expiry(key, self.window).await?;
        trace!(key, count, limit = self.limit, "window counted");

        if count > self.limit {
            Ok(RateLimitResult::Exceeded(count))
        } else {
            Ok(RateLimitResult::Allowed(count))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tollgate_store::{ManualClock, MemoryStore};

    fn store_with_clock() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 4, 23, 10, 0, 0).unwrap(),
        ));
        (MemoryStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn allows_up_to_limit() {
        let (store, _clock) = store_with_clock();
        let window = SlidingWindow::new(10, Duration::from_secs(1));

        for i in 1..=10 {
            assert_eq!(
                window.check(&store, "test-client").await.unwrap(),
                RateLimitResult::Allowed(i),
                "request {} should be allowed",
                i
            );
        }

        assert_eq!(
            window.check(&store, "test-client").await.unwrap(),
            RateLimitResult::Exceeded(11)
        );
    }

    #[tokio::test]
    async fn window_expiry_resets_count() {
        let (store, clock) = store_with_clock();
        let window = SlidingWindow::new(5, Duration::from_secs(1));

        for _ in 0..5 {
            window.check(&store, "rotate-client").await.unwrap();
        }
        assert!(!window.check(&store, "rotate-client").await.unwrap().is_allowed());

        clock.advance(Duration::from_secs(1));
        assert_eq!(
            window.check(&store, "rotate-client").await.unwrap(),
            RateLimitResult::Allowed(1)
        );
    }

    #[tokio::test]
    async fn rejected_requests_do_not_extend_window() {
        let (store, clock) = store_with_clock();
        let window = SlidingWindow::new(1, Duration::from_secs(10));

        window.check(&store, "k").await.unwrap();
        clock.advance(Duration::from_secs(6));
        assert!(!window.check(&store, "k").await.unwrap().is_allowed());
        clock.advance(Duration::from_secs(4));
        assert!(window.check(&store, "k").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn independent_keys() {
        let (store, _clock) = store_with_clock();
        let window = SlidingWindow::new(2, Duration::from_secs(1));

        assert!(window.check(&store, "a").await.unwrap().is_allowed());
        assert!(window.check(&store, "a").await.unwrap().is_allowed());
        assert!(!window.check(&store, "a").await.unwrap().is_allowed());

        assert!(window.check(&store, "b").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn zero_window_never_touches_store() {
        let (store, _clock) = store_with_clock();
        let window = SlidingWindow::new(1, Duration::ZERO);

        for _ in 0..100 {
            assert_eq!(window.check(&store, "k").await.unwrap(), RateLimitResult::Disabled);
        }
        assert!(store.is_empty());
    }
}
