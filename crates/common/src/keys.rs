//! Store key builders, one per key kind.
//!
//! ```text
//! {prefix}:ipBlacklist:{ip}                          → blacklist marker
//! {prefix}:rate:nonce:{ip}:{route}:{nonce}           → nonce window counter
//! {prefix}:rate:ip:{ip}:{route}                      → IP window counter
//! {prefix}:presignedUrl:{resource}:{validity_secs}   → cached access URL
//! {prefix}:lock:presignedUrl:{resource}:{validity}   → materialization lock
//! ```

use std::time::Duration;

/// Namespaced key builder.
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn ip_blacklist(&self, client_ip: &str) -> String {
        format!("{}:ipBlacklist:{}", self.prefix, client_ip)
    }

    pub fn nonce_rate(&self, client_ip: &str, route: &str, nonce: &str) -> String {
        format!("{}:rate:nonce:{}:{}:{}", self.prefix, client_ip, route, nonce)
    }

    pub fn ip_rate(&self, client_ip: &str, route: &str) -> String {
        format!("{}:rate:ip:{}:{}", self.prefix, client_ip, route)
    }

    /// Two validities for the same resource are distinct entries.
    pub fn presigned_url(&self, resource_key: &str, validity: Duration) -> String {
        format!(
            "{}:presignedUrl:{}:{}",
            self.prefix,
            resource_key,
            validity.as_secs()
        )
    }

    pub fn presigned_url_lock(&self, resource_key: &str, validity: Duration) -> String {
        format!(
            "{}:lock:presignedUrl:{}:{}",
            self.prefix,
            resource_key,
            validity.as_secs()
        )
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self::new("tollgate")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let keys = Keys::new("app");
        assert_eq!(keys.ip_blacklist("1.2.3.4"), "app:ipBlacklist:1.2.3.4");
        assert_eq!(keys.ip_rate("1.2.3.4", "/login"), "app:rate:ip:1.2.3.4:/login");
        assert_eq!(
            keys.nonce_rate("1.2.3.4", "/login", "abc"),
            "app:rate:nonce:1.2.3.4:/login:abc"
        );
    }

    #[test]
    fn validity_is_part_of_cache_identity() {
        let keys = Keys::default();
        let short = keys.presigned_url("img/a.png", Duration::from_secs(60));
        let long = keys.presigned_url("img/a.png", Duration::from_secs(3_600));
        assert_ne!(short, long);
        assert_eq!(short, "tollgate:presignedUrl:img/a.png:60");
        assert_eq!(
            keys.presigned_url_lock("img/a.png", Duration::from_secs(60)),
            "tollgate:lock:presignedUrl:img/a.png:60"
        );
    }
}
