use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};

/// Counters a [`StampedeCache`](crate::StampedeCache) reports into.
///
/// Clones share the underlying collectors.
#[derive(Clone)]
pub struct CacheMetrics {
    pub hits: IntCounter,
    pub misses: IntCounter,
    pub materializations: IntCounter,
    pub lock_timeouts: IntCounter,
    pub materialize_duration: Histogram,
}

impl CacheMetrics {
    /// Create the collectors and register them with `registry`.
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let hits = IntCounter::new("tollgate_cache_hits_total", "Cache lookups served from the store")?;
        let misses = IntCounter::new(
            "tollgate_cache_misses_total",
            "Cache lookups that missed on the fast path",
        )?;
        let materializations = IntCounter::new(
            "tollgate_cache_materializations_total",
            "Values produced by the resource provider",
        )?;
        let lock_timeouts = IntCounter::new(
            "tollgate_cache_lock_timeouts_total",
            "Resolves abandoned waiting for the materialization lock",
        )?;
        let materialize_duration = Histogram::with_opts(
            HistogramOpts::new(
                "tollgate_materialize_duration_seconds",
                "Time spent in the resource provider per materialization",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;

        registry.register(Box::new(hits.clone()))?;
        registry.register(Box::new(misses.clone()))?;
        registry.register(Box::new(materializations.clone()))?;
        registry.register(Box::new(lock_timeouts.clone()))?;
        registry.register(Box::new(materialize_duration.clone()))?;

        Ok(Self {
            hits,
            misses,
            materializations,
            lock_timeouts,
            materialize_duration,
        })
    }
}
