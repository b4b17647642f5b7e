use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tollgate_cache::CacheMetrics;

/// Process-wide Prometheus collectors for admission and caching.
pub struct GatekeeperMetrics {
    pub registry: Registry,
    pub requests_total: IntCounter,
    pub requests_admitted: IntCounter,
    pub requests_rejected: IntCounterVec,
    pub cache: CacheMetrics,
}

impl GatekeeperMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total =
            IntCounter::new("tollgate_requests_total", "Total requests checked").expect("valid metric");
        let requests_admitted =
            IntCounter::new("tollgate_requests_admitted", "Requests admitted").expect("valid metric");
        let requests_rejected = IntCounterVec::new(
            Opts::new("tollgate_requests_rejected", "Requests rejected, by reason"),
            &["reason"],
        )
        .expect("valid metric");

        registry
            .register(Box::new(requests_total.clone()))
            .expect("metric registered once");
        registry
            .register(Box::new(requests_admitted.clone()))
            .expect("metric registered once");
        registry
            .register(Box::new(requests_rejected.clone()))
            .expect("metric registered once");
        let cache = CacheMetrics::register(&registry).expect("metric registered once");

        Self {
            registry,
            requests_total,
            requests_admitted,
            requests_rejected,
            cache,
        }
    }

    /// Current values in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for GatekeeperMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_every_family() {
        let metrics = GatekeeperMetrics::new();
        metrics.requests_total.inc();
        metrics.requests_rejected.with_label_values(&["blacklisted"]).inc();
        metrics.cache.hits.inc();

        let text = metrics.render();
        assert!(text.contains("tollgate_requests_total 1"));
        assert!(text.contains(r#"tollgate_requests_rejected{reason="blacklisted"} 1"#));
        assert!(text.contains("tollgate_cache_hits_total 1"));
        assert!(text.contains("tollgate_materialize_duration_seconds_count 0"));
    }
}
