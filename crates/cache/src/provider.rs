use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tollgate_common::TollgateResult;
use tollgate_store::{clock, Clock, SystemClock};

use crate::signer::UrlSigner;

/// What the object store knows about a stored resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub content_length: u64,
    pub content_type: String,
    /// Name the resource was uploaded under, without extension.
    #[serde(default)]
    pub original_name: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    /// Playback length in seconds, for audio and video.
    #[serde(default)]
    pub length_in_time: Option<u64>,
    /// Key of a preview image stored alongside the resource.
    #[serde(default)]
    pub thumbnail_key: Option<String>,
}

impl ResourceMetadata {
    pub fn new(content_length: u64, content_type: impl Into<String>) -> Self {
        Self {
            content_length,
            content_type: content_type.into(),
            original_name: None,
            extension: None,
            length_in_time: None,
            thumbnail_key: None,
        }
    }

    pub fn original_full_name(&self) -> Option<String> {
        let name = self.original_name.as_deref()?;
        Some(match self.extension.as_deref() {
            Some(ext) if !ext.is_empty() => format!("{}.{}", name, ext),
            _ => name.to_string(),
        })
    }
}

/// The expensive upstream a [`StampedeCache`](crate::StampedeCache) shields.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Look the resource up. `Ok(None)` means it does not exist.
    async fn metadata(&self, key: &str) -> TollgateResult<Option<ResourceMetadata>>;

    /// Produce an access URL that stays usable for `validity`.
    async fn access_url(
        &self,
        key: &str,
        metadata: &ResourceMetadata,
        validity: Duration,
    ) -> TollgateResult<String>;
}

/// Where resource metadata comes from (an object store HEAD, a database row).
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn head(&self, key: &str) -> TollgateResult<Option<ResourceMetadata>>;
}

#[async_trait]
impl<T: ResourceProvider + ?Sized> ResourceProvider for Arc<T> {
    async fn metadata(&self, key: &str) -> TollgateResult<Option<ResourceMetadata>> {
        (**self).metadata(key).await
    }

    async fn access_url(
        &self,
        key: &str,
        metadata: &ResourceMetadata,
        validity: Duration,
    ) -> TollgateResult<String> {
        (**self).access_url(key, metadata, validity).await
    }
}

#[async_trait]
impl<T: MetadataSource + ?Sized> MetadataSource for Arc<T> {
    async fn head(&self, key: &str) -> TollgateResult<Option<ResourceMetadata>> {
        (**self).head(key).await
    }
}

/// In-process metadata table.
#[derive(Default)]
pub struct MemoryMetadataSource {
    entries: DashMap<String, ResourceMetadata>,
}

impl MemoryMetadataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, metadata: ResourceMetadata) {
        self.entries.insert(key.into(), metadata);
    }

    pub fn remove(&self, key: &str) -> Option<ResourceMetadata> {
        self.entries.remove(key).map(|(_, metadata)| metadata)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl MetadataSource for MemoryMetadataSource {
    async fn head(&self, key: &str) -> TollgateResult<Option<ResourceMetadata>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }
}

/// Issues HMAC-signed download URLs for resources described by `M`.
pub struct SignedUrlProvider<M> {
    source: M,
    signer: UrlSigner,
    clock: Arc<dyn Clock>,
}

impl<M: MetadataSource> SignedUrlProvider<M> {
    pub fn new(source: M, signer: UrlSigner) -> Self {
        Self::with_clock(source, signer, Arc::new(SystemClock))
    }

    pub fn with_clock(source: M, signer: UrlSigner, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            signer,
            clock,
        }
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    pub fn source(&self) -> &M {
        &self.source
    }
}

#[async_trait]
impl<M: MetadataSource> ResourceProvider for SignedUrlProvider<M> {
    async fn metadata(&self, key: &str) -> TollgateResult<Option<ResourceMetadata>> {
        self.source.head(key).await
    }

    async fn access_url(
        &self,
        key: &str,
        metadata: &ResourceMetadata,
        validity: Duration,
    ) -> TollgateResult<String> {
        let expires_at = clock::add_std(self.clock.now(), validity);

        let mut params = Vec::with_capacity(5);
        if let Some(name) = metadata.original_full_name() {
            params.push(("X-NT-OriginalFullName", name));
        }
        params.push(("X-NT-ContentLength", metadata.content_length.to_string()));
        params.push(("X-NT-ContentType", metadata.content_type.clone()));
        if let Some(length) = metadata.length_in_time {
            params.push(("X-NT-LengthInTime", length.to_string()));
        }
        if let Some(thumbnail) = metadata.thumbnail_key.as_deref() {
            params.push(("X-NT-Thumbnail", self.signer.sign(thumbnail, expires_at, &[])));
        }

        Ok(self.signer.sign(key, expires_at, &params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tollgate_store::ManualClock;

    fn video() -> ResourceMetadata {
        ResourceMetadata {
            content_length: 1_048_576,
            content_type: "video/mp4".into(),
            original_name: Some("holiday clip".into()),
            extension: Some("mp4".into()),
            length_in_time: Some(93),
            thumbnail_key: Some("thumb/holiday.jpg".into()),
        }
    }

    #[test]
    fn full_name_joins_extension() {
        assert_eq!(video().original_full_name().as_deref(), Some("holiday clip.mp4"));

        let mut bare = video();
        bare.extension = None;
        assert_eq!(bare.original_full_name().as_deref(), Some("holiday clip"));

        assert_eq!(ResourceMetadata::new(1, "text/plain").original_full_name(), None);
    }

    #[tokio::test]
    async fn memory_source_reports_absence() {
        let source = MemoryMetadataSource::new();
        source.insert("a", ResourceMetadata::new(3, "text/plain"));

        assert!(source.head("a").await.unwrap().is_some());
        assert!(source.head("b").await.unwrap().is_none());
        assert!(source.remove("a").is_some());
        assert!(source.is_empty());
    }

    #[tokio::test]
    async fn signed_url_carries_metadata_and_verifies() {
        let now = Utc.with_ymd_and_hms(2024, 4, 23, 10, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(now));
        let source = MemoryMetadataSource::new();
        source.insert("video/holiday.mp4", video());

        let signer = UrlSigner::new("https://files.example.com", "s3cret");
        let provider = SignedUrlProvider::with_clock(source, signer.clone(), clock);

        let metadata = provider.metadata("video/holiday.mp4").await.unwrap().unwrap();
        let url = provider
            .access_url("video/holiday.mp4", &metadata, Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(url.starts_with("https://files.example.com/video/holiday.mp4?X-NT-Expires="));
        assert!(url.contains("&X-NT-OriginalFullName=holiday%20clip.mp4&"));
        assert!(url.contains("X-NT-ContentLength=1048576"));
        assert!(url.contains("X-NT-ContentType=video%2Fmp4"));
        assert!(url.contains("X-NT-LengthInTime=93"));
        assert!(url.contains("X-NT-Thumbnail=https%3A%2F%2Ffiles.example.com%2Fthumb%2Fholiday.jpg"));

        assert!(signer.verify(&url, now).is_ok());
        assert!(signer.verify(&url, now + chrono::Duration::seconds(3600)).is_err());
    }

    #[tokio::test]
    async fn optional_params_are_omitted() {
        let source = MemoryMetadataSource::new();
        let provider = SignedUrlProvider::new(source, UrlSigner::new("https://f", "k"));

        let url = provider
            .access_url("doc.txt", &ResourceMetadata::new(12, "text/plain"), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(!url.contains("X-NT-OriginalFullName"));
        assert!(!url.contains("X-NT-LengthInTime"));
        assert!(!url.contains("X-NT-Thumbnail"));
        assert!(provider.signer().verify(&url, Utc::now()).is_ok());
    }
}
