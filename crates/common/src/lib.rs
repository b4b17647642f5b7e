//! Shared configuration, error and key types for tollgate.

pub mod config;
pub mod error;
pub mod keys;

pub use config::{
    AppConfig, AuditConfig, CacheConfig, IpRateConfig, NonceRateConfig, RateConfig,
    RateIntervalUnit, SigningConfig, StoreBackend, StoreConfig,
};
pub use error::{RejectReason, TollgateError, TollgateResult};
pub use keys::Keys;
