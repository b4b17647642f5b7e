use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level tollgate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub rate: RateConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Deadline applied to every store round trip. 0 disables it.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// How often the memory backend sweeps expired entries and lapsed leases.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            command_timeout_ms: default_command_timeout_ms(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl StoreConfig {
    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_ms > 0).then(|| Duration::from_millis(self.command_timeout_ms))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Request admission limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    /// A header timestamp may lag the store clock by at most this many
    /// seconds. 0 disables the check.
    #[serde(default = "default_max_time_diff", alias = "maxTimeDiff")]
    pub max_time_diff: u64,
    /// UTC offset used to find "end of today" for blacklist entries.
    /// Falls back to the host's local offset.
    #[serde(default, alias = "blacklistUtcOffsetMinutes")]
    pub blacklist_utc_offset_minutes: Option<i32>,
    #[serde(default)]
    pub nonce: NonceRateConfig,
    #[serde(default)]
    pub ip: IpRateConfig,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            max_time_diff: default_max_time_diff(),
            blacklist_utc_offset_minutes: None,
            nonce: NonceRateConfig::default(),
            ip: IpRateConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateIntervalUnit {
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl RateIntervalUnit {
    /// Length of `interval` units as a [`Duration`].
    pub fn to_duration(self, interval: u64) -> Duration {
        match self {
            RateIntervalUnit::Milliseconds => Duration::from_millis(interval),
            RateIntervalUnit::Seconds => Duration::from_secs(interval),
            RateIntervalUnit::Minutes => Duration::from_secs(interval.saturating_mul(60)),
            RateIntervalUnit::Hours => Duration::from_secs(interval.saturating_mul(3_600)),
            RateIntervalUnit::Days => Duration::from_secs(interval.saturating_mul(86_400)),
        }
    }
}

/// Limit on how often the same nonce may be submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceRateConfig {
    #[serde(default = "default_nonce_rate")]
    pub rate: u64,
    /// 0 disables the nonce check.
    #[serde(default = "default_nonce_interval", alias = "rateInterval")]
    pub rate_interval: u64,
    #[serde(default = "default_interval_unit", alias = "rateIntervalUnit")]
    pub rate_interval_unit: RateIntervalUnit,
}

impl Default for NonceRateConfig {
    fn default() -> Self {
        Self {
            rate: default_nonce_rate(),
            rate_interval: default_nonce_interval(),
            rate_interval_unit: default_interval_unit(),
        }
    }
}

/// Per-IP, per-route request limit. Breaching it blacklists the IP until the
/// end of the day when `open_blacklist` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpRateConfig {
    #[serde(default = "default_ip_rate")]
    pub rate: u64,
    /// 0 disables the IP check.
    #[serde(default = "default_ip_interval", alias = "rateInterval")]
    pub rate_interval: u64,
    #[serde(default = "default_interval_unit", alias = "rateIntervalUnit")]
    pub rate_interval_unit: RateIntervalUnit,
    #[serde(default = "default_true", alias = "openBlacklist")]
    pub open_blacklist: bool,
}

impl Default for IpRateConfig {
    fn default() -> Self {
        Self {
            rate: default_ip_rate(),
            rate_interval: default_ip_interval(),
            rate_interval_unit: default_interval_unit(),
            open_blacklist: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_lock_wait_secs")]
    pub lock_wait_secs: u64,
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,
    /// Subtracted from the requested validity when caching, to cover
    /// materialization and delivery latency.
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: u64,
    #[serde(default = "default_validity_secs")]
    pub default_validity_secs: u64,
    /// Fraction of the safety margin at which a slow materialization is
    /// reported.
    #[serde(default = "default_latency_alarm_ratio")]
    pub latency_alarm_ratio: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lock_wait_secs: default_lock_wait_secs(),
            lock_lease_secs: default_lock_lease_secs(),
            safety_margin_secs: default_safety_margin_secs(),
            default_validity_secs: default_validity_secs(),
            latency_alarm_ratio: default_latency_alarm_ratio(),
        }
    }
}

impl CacheConfig {
    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_secs)
    }

    pub fn default_validity(&self) -> Duration {
        Duration::from_secs(self.default_validity_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_signing_secret")]
    pub secret: String,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            secret: default_signing_secret(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_audit_capacity")]
    pub capacity: usize,
    /// Extra request fields to redact on top of the built-in password fields.
    #[serde(default)]
    pub exclude_fields: Vec<String>,
    /// `code` value in a JSON response body that marks a successful call.
    #[serde(default)]
    pub success_code: i64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: default_audit_capacity(),
            exclude_fields: vec![],
            success_code: 0,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}
fn default_store_backend() -> StoreBackend {
    StoreBackend::Memory
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_key_prefix() -> String {
    "tollgate".to_string()
}
fn default_command_timeout_ms() -> u64 {
    500
}
fn default_cleanup_interval_secs() -> u64 {
    60
}
fn default_max_time_diff() -> u64 {
    60
}
fn default_nonce_rate() -> u64 {
    1
}
fn default_nonce_interval() -> u64 {
    60
}
fn default_ip_rate() -> u64 {
    5
}
fn default_ip_interval() -> u64 {
    1
}
fn default_interval_unit() -> RateIntervalUnit {
    RateIntervalUnit::Seconds
}
fn default_lock_wait_secs() -> u64 {
    10
}
fn default_lock_lease_secs() -> u64 {
    30
}
fn default_safety_margin_secs() -> u64 {
    7
}
fn default_validity_secs() -> u64 {
    3_600
}
fn default_latency_alarm_ratio() -> f64 {
    0.8
}
fn default_base_url() -> String {
    "http://127.0.0.1:9000".to_string()
}
fn default_audit_capacity() -> usize {
    1_024
}
/// Per-process random secret, so unconfigured instances never share one.
fn default_signing_secret() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.store.key_prefix.is_empty() {
            anyhow::bail!("store.key_prefix must not be empty");
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_empty() {
            anyhow::bail!("store.redis_url is required for the redis backend");
        }
        if self.store.cleanup_interval_secs == 0 {
            anyhow::bail!("store.cleanup_interval_secs must be at least 1");
        }

        if self.rate.nonce.rate == 0 {
            anyhow::bail!("rate.nonce.rate must be at least 1");
        }
        if self.rate.ip.rate == 0 {
            anyhow::bail!("rate.ip.rate must be at least 1");
        }
        if let Some(offset) = self.rate.blacklist_utc_offset_minutes {
            if offset.abs() >= 24 * 60 {
                anyhow::bail!(
                    "rate.blacklist_utc_offset_minutes out of range: {}",
                    offset
                );
            }
        }

        if self.cache.lock_wait_secs == 0 {
            anyhow::bail!("cache.lock_wait_secs must be at least 1");
        }
        if self.cache.lock_lease_secs == 0 {
            anyhow::bail!("cache.lock_lease_secs must be at least 1");
        }
        if self.cache.default_validity_secs <= self.cache.safety_margin_secs {
            anyhow::bail!(
                "cache.default_validity_secs ({}) must exceed cache.safety_margin_secs ({})",
                self.cache.default_validity_secs,
                self.cache.safety_margin_secs
            );
        }
        if !(self.cache.latency_alarm_ratio > 0.0 && self.cache.latency_alarm_ratio <= 1.0) {
            anyhow::bail!("cache.latency_alarm_ratio must be in (0, 1]");
        }

        if self.signing.secret.is_empty() {
            anyhow::bail!("signing.secret must not be empty");
        }
        if self.audit.enabled && self.audit.capacity == 0 {
            anyhow::bail!("audit.capacity must be at least 1 when auditing is enabled");
        }

        Ok(())
    }
}
