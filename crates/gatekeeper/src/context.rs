use std::sync::Arc;

use anyhow::Context as _;
use tokio::task::JoinHandle;
use tollgate_cache::{
    CacheSettings, MemoryMetadataSource, SignedUrlProvider, StampedeCache, UrlSigner,
};
use tollgate_common::{AppConfig, Keys, StoreBackend};
use tollgate_store::{
    Deadline, KvStore, LockManager, MemoryLockManager, MemoryStore, RedisLockManager, RedisStore,
};
use tracing::info;

use crate::audit::{AuditPolicy, AuditSink, ChannelAuditSink, NoopAuditSink, TracingAuditWriter};
use crate::metrics::GatekeeperMetrics;
use crate::Gatekeeper;

/// Every long-lived component, built once at startup from configuration.
pub struct AppContext {
    pub config: AppConfig,
    pub keys: Keys,
    pub store: Arc<dyn KvStore>,
    pub locks: Arc<dyn LockManager>,
    pub metrics: Arc<GatekeeperMetrics>,
    pub gatekeeper: Gatekeeper,
    pub cache: StampedeCache,
    /// Resources the cache's signed-URL provider knows about.
    pub resources: Arc<MemoryMetadataSource>,
    pub audit_policy: AuditPolicy,
    pub audit: Arc<dyn AuditSink>,
    audit_task: Option<JoinHandle<()>>,
    cleanup_tasks: Vec<JoinHandle<()>>,
}

impl AppContext {
    /// Connect to the configured backend and assemble the context.
    /// Must run inside a tokio runtime.
    pub fn bootstrap(config: AppConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let mut cleanup_tasks = Vec::new();
        let (store, locks): (Arc<dyn KvStore>, Arc<dyn LockManager>) = match config.store.backend {
            StoreBackend::Memory => {
                let store = Arc::new(MemoryStore::new());
                let locks = Arc::new(MemoryLockManager::new());
                let every = config.store.cleanup_interval();
                cleanup_tasks.push(store.start_cleanup_task(every));
                cleanup_tasks.push(locks.start_cleanup_task(every));
                info!(?every, "memory backend cleanup started");
                (store as Arc<dyn KvStore>, locks as Arc<dyn LockManager>)
            }
            StoreBackend::Redis => {
                let store = RedisStore::open(&config.store.redis_url)
                    .with_context(|| format!("opening redis store at {}", config.store.redis_url))?;
                let locks = RedisLockManager::open(&config.store.redis_url)
                    .with_context(|| format!("opening redis locks at {}", config.store.redis_url))?;
                (Arc::new(store), Arc::new(locks))
            }
        };
        info!(backend = ?config.store.backend, "store backend selected");

        let (store, locks) = match config.store.command_timeout() {
            Some(timeout) => {
                info!(?timeout, "store command deadline enabled");
                let store: Arc<dyn KvStore> = Arc::new(Deadline::new(store, timeout));
                let locks: Arc<dyn LockManager> = Arc::new(Deadline::new(locks, timeout));
                (store, locks)
            }
            None => (store, locks),
        };

        let mut ctx = Self::with_backends(config, store, locks)?;
        ctx.cleanup_tasks = cleanup_tasks;
        Ok(ctx)
    }

    /// Assemble the context over already constructed backends.
    pub fn with_backends(
        config: AppConfig,
        store: Arc<dyn KvStore>,
        locks: Arc<dyn LockManager>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let keys = Keys::new(config.store.key_prefix.clone());
        let metrics = Arc::new(GatekeeperMetrics::new());

        let gatekeeper = Gatekeeper::from_config(store.clone(), keys.clone(), &config.rate)
            .context("building gatekeeper")?
            .with_metrics(metrics.clone());

        let resources = Arc::new(MemoryMetadataSource::new());
        let signer = UrlSigner::new(&config.signing.base_url, &config.signing.secret);
        let provider = Arc::new(SignedUrlProvider::new(resources.clone(), signer));
        let cache = StampedeCache::new(
            store.clone(),
            locks.clone(),
            provider,
            keys.clone(),
            CacheSettings::from(&config.cache),
        )
        .with_metrics(metrics.cache.clone());

        let audit_policy = AuditPolicy::from_config(&config.audit);
        let (audit, audit_task): (Arc<dyn AuditSink>, _) = if config.audit.enabled {
            let (sink, task) = ChannelAuditSink::spawn(config.audit.capacity, TracingAuditWriter);
            (Arc::new(sink), Some(task))
        } else {
            info!("request audit disabled");
            (Arc::new(NoopAuditSink), None)
        };

        Ok(Self {
            config,
            keys,
            store,
            locks,
            metrics,
            gatekeeper,
            cache,
            resources,
            audit_policy,
            audit,
            audit_task,
            cleanup_tasks: Vec::new(),
        })
    }

    /// Flush queued audit records and stop the writer and cleanup tasks.
    pub async fn shutdown(self) {
        let Self {
            audit,
            audit_task,
            cleanup_tasks,
            ..
        } = self;
        for task in cleanup_tasks {
            task.abort();
        }
        drop(audit);
        if let Some(task) = audit_task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "audit task ended abnormally");
            }
        }
        info!("tollgate context shut down");
    }
}
