use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why the gatekeeper turned a request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    Blacklisted,
    StaleTimestamp,
    NonceRateExceeded,
    IpRateExceeded,
    /// The shared store could not be consulted; requests fail closed.
    StoreUnavailable,
}

impl RejectReason {
    /// Stable reason code for logs, metrics and responses.
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::Blacklisted => "blacklisted",
            RejectReason::StaleTimestamp => "stale-timestamp",
            RejectReason::NonceRateExceeded => "nonce-rate-exceeded",
            RejectReason::IpRateExceeded => "ip-rate-exceeded",
            RejectReason::StoreUnavailable => "store-unavailable",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Error)]
pub enum TollgateError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("lock {key} not acquired within {waited:?}")]
    LockTimeout { key: String, waited: Duration },

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("resource key must not be blank")]
    InvalidResourceKey,

    #[error("resource provider error: {0}")]
    Provider(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("store operation {operation} exceeded {timeout:?}")]
    StoreTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("request rejected: {0}")]
    Rejected(RejectReason),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TollgateError {
    /// Whether the failure came from the shared store or lock backend.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            TollgateError::Store(_) | TollgateError::StoreTimeout { .. }
        )
    }
}

pub type TollgateResult<T> = Result<T, TollgateError>;
