//! Request admission for tollgate.
//!
//! [`Gatekeeper::check`] runs the admission stages in a fixed order and stops
//! at the first rejection:
//!
//! 1. blacklist
//! 2. nonce stage: header timestamp freshness, then nonce replay window
//! 3. per-IP rate window, which lists the IP on breach when configured to
//!
//! Rejections are returned as [`Decision`] values. A store failure at any
//! stage rejects the request rather than letting it through.

pub mod audit;
pub mod context;
pub mod metrics;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tollgate_blacklist::Blacklist;
use tollgate_common::{Keys, RateConfig, RejectReason, TollgateError, TollgateResult};
use tollgate_rate_limit::{Policy, RateLimiter};
use tollgate_store::KvStore;
use tracing::{debug, error, info};

pub use audit::{
    AuditPolicy, AuditRecord, AuditRequest, AuditSink, AuditWriter, ChannelAuditSink,
    NoopAuditSink, TracingAuditWriter,
};
pub use context::AppContext;
pub use metrics::GatekeeperMetrics;

/// What the gatekeeper needs to know about an inbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    pub client_ip: String,
    /// Route identifier, typically the request path.
    pub route: String,
    #[serde(default)]
    pub nonce: Option<String>,
    /// Client-supplied send time, epoch milliseconds.
    #[serde(default, alias = "timestamp")]
    pub timestamp_millis: Option<i64>,
}

impl RequestInfo {
    pub fn new(client_ip: impl Into<String>, route: impl Into<String>) -> Self {
        Self {
            client_ip: client_ip.into(),
            route: route.into(),
            nonce: None,
            timestamp_millis: None,
        }
    }

    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp_millis = Some(at.timestamp_millis());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "lowercase")]
pub enum Decision {
    Admitted,
    Rejected(RejectReason),
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted)
    }

    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            Decision::Admitted => None,
            Decision::Rejected(reason) => Some(*reason),
        }
    }

    pub fn into_result(self) -> TollgateResult<()> {
        match self {
            Decision::Admitted => Ok(()),
            Decision::Rejected(reason) => Err(TollgateError::Rejected(reason)),
        }
    }
}

pub struct Gatekeeper {
    store: Arc<dyn KvStore>,
    limiter: RateLimiter,
    blacklist: Blacklist,
    keys: Keys,
    /// Allowed lag of a header timestamp behind store time, in ms. 0 disables.
    max_time_diff_ms: i64,
    open_blacklist: bool,
    metrics: Option<Arc<GatekeeperMetrics>>,
}

impl Gatekeeper {
    pub fn new(
        store: Arc<dyn KvStore>,
        limiter: RateLimiter,
        blacklist: Blacklist,
        keys: Keys,
        config: &RateConfig,
    ) -> Self {
        info!(
            max_time_diff = config.max_time_diff,
            open_blacklist = config.ip.open_blacklist,
            "creating gatekeeper"
        );
        Self {
            store,
            limiter,
            blacklist,
            keys,
            max_time_diff_ms: i64::try_from(config.max_time_diff)
                .unwrap_or(i64::MAX)
                .saturating_mul(1000),
            open_blacklist: config.ip.open_blacklist,
            metrics: None,
        }
    }

    /// Build the limiter and blacklist from `config` over one shared store.
    pub fn from_config(store: Arc<dyn KvStore>, keys: Keys, config: &RateConfig) -> TollgateResult<Self> {
        let limiter = RateLimiter::from_config(store.clone(), config);
        let blacklist = Blacklist::from_config(store.clone(), keys.clone(), config)?;
        Ok(Self::new(store, limiter, blacklist, keys, config))
    }

    pub fn with_metrics(mut self, metrics: Arc<GatekeeperMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub async fn check(&self, request: &RequestInfo) -> Decision {
        if let Some(metrics) = &self.metrics {
            metrics.requests_total.inc();
        }

        let decision = match self.evaluate(request).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(
                    client_ip = %request.client_ip,
                    route = %request.route,
                    error = %e,
                    "store failure during admission, rejecting"
                );
                Decision::Rejected(RejectReason::StoreUnavailable)
            }
        };

        match decision {
            Decision::Admitted => {
                debug!(client_ip = %request.client_ip, route = %request.route, "request admitted");
                if let Some(metrics) = &self.metrics {
                    metrics.requests_admitted.inc();
                }
            }
            Decision::Rejected(reason) => {
                info!(
                    client_ip = %request.client_ip,
                    route = %request.route,
                    reason = reason.code(),
                    "request rejected"
                );
                if let Some(metrics) = &self.metrics {
                    metrics
                        .requests_rejected
                        .with_label_values(&[reason.code()])
                        .inc();
                }
            }
        }
        decision
    }

    async fn evaluate(&self, request: &RequestInfo) -> TollgateResult<Decision> {
        let ip = request.client_ip.as_str();
        let route = request.route.as_str();

        if self.blacklist.is_blacklisted(ip).await? {
            return Ok(Decision::Rejected(RejectReason::Blacklisted));
        }

        if let Some(sent_at) = request.timestamp_millis {
            if self.is_stale(sent_at).await? {
                return Ok(Decision::Rejected(RejectReason::StaleTimestamp));
            }
        }

        if let Some(nonce) = request.nonce.as_deref() {
            let key = self.keys.nonce_rate(ip, route, nonce);
            if !self.limiter.check_and_increment(Policy::Nonce, &key).await? {
                return Ok(Decision::Rejected(RejectReason::NonceRateExceeded));
            }
        }

        let key = self.keys.ip_rate(ip, route);
        if !self.limiter.check_and_increment(Policy::Ip, &key).await? {
            if self.open_blacklist {
                self.blacklist.blacklist(ip).await?;
            }
            return Ok(Decision::Rejected(RejectReason::IpRateExceeded));
        }

        Ok(Decision::Admitted)
    }

    /// A timestamp older than store time by more than the allowed drift.
    /// Timestamps ahead of the store clock are accepted.
    async fn is_stale(&self, sent_at_millis: i64) -> TollgateResult<bool> {
        if self.max_time_diff_ms == 0 {
            return Ok(false);
        }
        let now = self.store.now().await?;
        let lag = now.timestamp_millis().saturating_sub(sent_at_millis);
        Ok(lag > self.max_time_diff_ms)
    }
}
