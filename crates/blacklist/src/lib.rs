use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local, Offset, TimeZone, Utc};
use tollgate_common::{Keys, RateConfig, TollgateError, TollgateResult};
use tollgate_store::KvStore;
use tracing::{debug, info, warn};

/// IP deny-list held in the shared store.
///
/// An IP stays listed until the end of the calendar day on which it was
/// listed, measured in the configured UTC offset against the store's clock.
/// An IP listed at 23:59 is free a minute later; one listed at 00:01 is
/// blocked for almost a day. Entries are never extended early.
pub struct Blacklist {
    store: Arc<dyn KvStore>,
    keys: Keys,
    offset: FixedOffset,
}

impl Blacklist {
    pub fn new(store: Arc<dyn KvStore>, keys: Keys, offset: FixedOffset) -> Self {
        Self {
            store,
            keys,
            offset,
        }
    }

    /// Build from rate configuration, falling back to the host's local
    /// offset when none is configured.
    pub fn from_config(store: Arc<dyn KvStore>, keys: Keys, config: &RateConfig) -> TollgateResult<Self> {
        let offset = match config.blacklist_utc_offset_minutes {
            Some(minutes) => FixedOffset::east_opt(minutes * 60).ok_or_else(|| {
                TollgateError::Config(format!("invalid blacklist UTC offset: {} minutes", minutes))
            })?,
            None => Local::now().offset().fix(),
        };
        info!(%offset, "blacklist day boundary offset");
        Ok(Self::new(store, keys, offset))
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Returns `true` if the address is currently listed.
    pub async fn is_blacklisted(&self, client_ip: &str) -> TollgateResult<bool> {
        let listed = self
            .store
            .get(&self.keys.ip_blacklist(client_ip))
            .await?
            .is_some();
        if listed {
            debug!(client_ip, "blacklist hit");
        }
        Ok(listed)
    }

    /// List `client_ip` until the end of the current day and return the
    /// instant the entry lapses.
    pub async fn blacklist(&self, client_ip: &str) -> TollgateResult<DateTime<Utc>> {
        let now = self.store.now().await?;
        let until = end_of_day(now, self.offset)?;
        let ttl = (until - now).to_std().unwrap_or(Duration::ZERO);

        self.store
            .set_with_expiry(&self.keys.ip_blacklist(client_ip), &until.to_rfc3339(), ttl)
            .await?;

        info!(client_ip, until = %until, "IP blacklisted until end of day");
        Ok(until)
    }

    /// When the listing for `client_ip` lapses, if it is listed.
    pub async fn expires_at(&self, client_ip: &str) -> TollgateResult<Option<DateTime<Utc>>> {
        let Some(value) = self.store.get(&self.keys.ip_blacklist(client_ip)).await? else {
            return Ok(None);
        };

        match DateTime::parse_from_rfc3339(&value) {
            Ok(at) => Ok(Some(at.with_timezone(&Utc))),
            Err(e) => {
                warn!(client_ip, value = %value, error = %e, "unreadable blacklist entry");
                Ok(None)
            }
        }
    }
}

/// The next midnight after `now` in `offset`, as a UTC instant.
pub fn end_of_day(now: DateTime<Utc>, offset: FixedOffset) -> TollgateResult<DateTime<Utc>> {
    let local_midnight = now
        .with_timezone(&offset)
        .date_naive()
        .succ_opt()
        .and_then(|tomorrow| tomorrow.and_hms_opt(0, 0, 0))
        .ok_or_else(|| TollgateError::Other(anyhow::anyhow!("no day after {}", now)))?;

    offset
        .from_local_datetime(&local_midnight)
        .single()
        .map(|at| at.with_timezone(&Utc))
        .ok_or_else(|| TollgateError::Other(anyhow::anyhow!("ambiguous midnight after {}", now)))
}
