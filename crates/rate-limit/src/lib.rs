//! Request rate limiting for tollgate.
//!
//! Two independent policies are enforced, each as a window counter held in
//! the shared [`KvStore`](tollgate_store::KvStore):
//!
//! - **Nonce** -- how many times the same nonce may be submitted to a route
//!   from one client per interval. Replays beyond that are rejected.
//!
//! - **IP** -- how many requests one client may send to a route per
//!   interval. Breaches are what the gatekeeper escalates to the blacklist.
//!
//! Each counter is created and given its TTL by a single atomic store call,
//! so concurrent requests on any instance share one window. An interval of
//! zero switches a policy off entirely.

pub mod sliding_window;

use std::sync::Arc;

use tollgate_common::{IpRateConfig, NonceRateConfig, RateConfig, TollgateResult};
use tollgate_store::KvStore;

pub use sliding_window::{RateLimitResult, SlidingWindow};

/// Which limit a request is being counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Nonce,
    Ip,
}

/// The rate limiter shared by every request task.
///
/// Cheaply cloneable (backed by `Arc`); clones count against the same store.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

struct RateLimiterInner {
    store: Arc<dyn KvStore>,
    nonce: SlidingWindow,
    ip: SlidingWindow,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, nonce: SlidingWindow, ip: SlidingWindow) -> Self {
        tracing::info!(
            nonce_rate = nonce.limit(),
            nonce_window = ?nonce.window(),
            ip_rate = ip.limit(),
            ip_window = ?ip.window(),
            "creating rate limiter"
        );
        Self {
            inner: Arc::new(RateLimiterInner { store, nonce, ip }),
        }
    }

    pub fn from_config(store: Arc<dyn KvStore>, config: &RateConfig) -> Self {
        Self::new(store, nonce_window(&config.nonce), ip_window(&config.ip))
    }

    pub fn is_enabled(&self, policy: Policy) -> bool {
        !self.window(policy).is_disabled()
    }

    pub fn window(&self, policy: Policy) -> &SlidingWindow {
        match policy {
            Policy::Nonce => &self.inner.nonce,
            Policy::Ip => &self.inner.ip,
        }
    }

    /// Count one request for `subject_key` under `policy`.
    pub async fn check(&self, policy: Policy, subject_key: &str) -> TollgateResult<RateLimitResult> {
        self.window(policy)
            .check(self.inner.store.as_ref(), subject_key)
            .await
    }

    /// Count one request and report whether it is within the limit.
    pub async fn check_and_increment(&self, policy: Policy, subject_key: &str) -> TollgateResult<bool> {
        Ok(self.check(policy, subject_key).await?.is_allowed())
    }
}

fn nonce_window(config: &NonceRateConfig) -> SlidingWindow {
    SlidingWindow::new(
        config.rate,
        config.rate_interval_unit.to_duration(config.rate_interval),
    )
}

fn ip_window(config: &IpRateConfig) -> SlidingWindow {
    SlidingWindow::new(
        config.rate,
        config.rate_interval_unit.to_duration(config.rate_interval),
    )
}
