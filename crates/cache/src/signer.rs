use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const EXPIRES_PARAM: &str = "X-NT-Expires";
pub const SIGNATURE_PARAM: &str = "X-NT-Signature";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("URL is not a signed access URL")]
    Malformed,
    #[error("signature mismatch")]
    BadSignature,
    #[error("URL expired at {0}")]
    Expired(DateTime<Utc>),
}

/// Produces and checks time-limited access URLs.
///
/// The signature is an HMAC-SHA256 over `"{path}?{query}"` where the query
/// already carries the expiry, so neither the resource, its parameters nor
/// the deadline can be altered without invalidating it.
#[derive(Clone)]
pub struct UrlSigner {
    base_url: String,
    secret: Vec<u8>,
}

impl UrlSigner {
    pub fn new(base_url: &str, secret: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            secret: secret.as_bytes().to_vec(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sign `key` with extra query `params`, valid until `expires_at`.
    pub fn sign(&self, key: &str, expires_at: DateTime<Utc>, params: &[(&str, String)]) -> String {
        let path = encode_path(key);

        let query = std::iter::once(format!("{}={}", EXPIRES_PARAM, expires_at.timestamp()))
            .chain(
                params
                    .iter()
                    .map(|(name, value)| format!("{}={}", name, urlencoding::encode(value))),
            )
            .collect::<Vec<_>>()
            .join("&");

        let signature = hex::encode(self.mac(&path, &query).finalize().into_bytes());
        format!(
            "{}{}?{}&{}={}",
            self.base_url, path, query, SIGNATURE_PARAM, signature
        )
    }

    /// Check that `url` was produced by this signer and has not expired.
    pub fn verify(&self, url: &str, now: DateTime<Utc>) -> Result<(), VerifyError> {
        let rest = url.strip_prefix(&self.base_url).ok_or(VerifyError::Malformed)?;
        let (path, query) = rest.split_once('?').ok_or(VerifyError::Malformed)?;
        let marker = format!("&{}=", SIGNATURE_PARAM);
        let (signed_query, signature) = query.rsplit_once(&marker).ok_or(VerifyError::Malformed)?;

        let signature = hex::decode(signature).map_err(|_| VerifyError::Malformed)?;
        self.mac(path, signed_query)
            .verify_slice(&signature)
            .map_err(|_| VerifyError::BadSignature)?;

        let expires = signed_query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(name, _)| *name == EXPIRES_PARAM)
            .and_then(|(_, value)| value.parse::<i64>().ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or(VerifyError::Malformed)?;

        if now >= expires {
            return Err(VerifyError::Expired(expires));
        }
        Ok(())
    }

    fn mac(&self, path: &str, query: &str) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(path.as_bytes());
        mac.update(b"?");
        mac.update(query.as_bytes());
        mac
    }
}

/// Percent-encode each path segment, keeping the separators.
fn encode_path(key: &str) -> String {
    key.trim_start_matches('/')
        .split('/')
        .map(|segment| format!("/{}", urlencoding::encode(segment)))
        .collect()
}
