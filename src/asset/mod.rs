//! Content-addressed assets attached to records.
//!
//! This module provides:
//! - `Fingerprint` computation for raw blobs
//! - `AssetReference`, the wire-level pointer a record carries for each blob
//! - The `Asset` capability trait with local and remote variants
//! - `AssetHandle`, a scoped open reference released on drop

pub mod expiry;
pub mod fingerprint;
pub mod remote;

pub use fingerprint::{fingerprint_for, Fingerprint, FingerprintError};
pub use remote::{RemoteAsset, UrlRefreshed};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::error;
use url::Url;

/// Errors that can occur while resolving or opening assets
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssetError {
    #[error("Asset has no download URL")]
    MissingDownloadUrl,

    #[error("No asset reference with fingerprint {0}")]
    ReferenceNotFound(String),

    #[error("URL refresh failed with status {status}")]
    RefreshFailed { status: u16 },

    #[error("Invalid URL from server: {0}")]
    InvalidUrl(String),

    #[error("Unbalanced close on asset {0}")]
    UnbalancedClose(String),

    #[error("Asset source error: {0}")]
    Source(String),
}

/// Result type for asset operations
pub type AssetResult<T> = Result<T, AssetError>;

/// A record-attached pointer to a fingerprint-identified blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetReference {
    pub fingerprint: Fingerprint,
    #[serde(default)]
    pub uploaded: bool,
    /// Stable indirection endpoint that hands out presigned URLs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    /// Short-lived signed URL; may carry an expiry query parameter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presigned_download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiate_upload_url: Option<String>,
}

impl AssetReference {
    /// A reference for content that has not been uploaded yet
    pub fn pending(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            uploaded: false,
            download_url: None,
            presigned_download_url: None,
            initiate_upload_url: None,
        }
    }

    pub fn with_download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = Some(url.into());
        self
    }

    pub fn with_presigned_url(mut self, url: impl Into<String>) -> Self {
        self.presigned_download_url = Some(url.into());
        self
    }

    pub fn uploaded(mut self) -> Self {
        self.uploaded = true;
        self
    }

    /// Whether the presigned URL is missing or past its embedded expiry
    pub fn has_expired(&self) -> bool {
        match self.presigned_download_url.as_deref().map(Url::parse) {
            Some(Ok(url)) => expiry::has_expired(&url, chrono::Utc::now()),
            _ => true,
        }
    }
}

/// Where an opened asset's content can be read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetLocation {
    /// Bytes already held in memory
    Local { fingerprint: Option<Fingerprint>, bytes: Bytes },
    /// A presigned URL that was fresh when handed out
    Remote(Url),
}

impl AssetLocation {
    pub fn url(&self) -> Option<&Url> {
        match self {
            AssetLocation::Remote(url) => Some(url),
            AssetLocation::Local { .. } => None,
        }
    }
}

/// Network side of remote assets, implemented by the sync client
#[async_trait]
pub trait AssetSource: Send + Sync {
    /// Exchange a stable download URL for a fresh presigned URL
    async fn resolve_presigned_url(&self, download_url: &str) -> AssetResult<Url>;

    /// Fetch the bytes behind a presigned URL
    async fn fetch(&self, url: &Url) -> AssetResult<Bytes>;
}

/// Capabilities shared by every asset variant
#[async_trait]
pub trait Asset: Send + Sync {
    fn fingerprint(&self) -> Option<&Fingerprint>;

    /// Number of currently outstanding open handles
    fn open_count(&self) -> usize;

    /// Open the asset, returning a handle that releases on drop
    async fn open(&self) -> AssetResult<AssetHandle>;

    /// Read the full content
    async fn open_as_blob(&self) -> AssetResult<Bytes>;
}

/// Open-reference bookkeeping owned by an asset
pub(crate) trait OpenCounter: Send + Sync {
    /// Decrement the open count, returning the remaining count
    fn release(&self) -> AssetResult<usize>;
}

/// A scoped open reference to an asset.
///
/// The open count is decremented exactly once, either by [`AssetHandle::close`]
/// or when the handle is dropped (including on error paths).
pub struct AssetHandle {
    location: AssetLocation,
    owner: Option<Arc<dyn OpenCounter>>,
}

impl AssetHandle {
    pub(crate) fn new(location: AssetLocation, owner: Arc<dyn OpenCounter>) -> Self {
        Self {
            location,
            owner: Some(owner),
        }
    }

    pub fn location(&self) -> &AssetLocation {
        &self.location
    }

    /// Release the open reference explicitly, surfacing an unbalanced close
    pub fn close(mut self) -> AssetResult<()> {
        match self.owner.take() {
            Some(owner) => owner.release().map(|_| ()),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for AssetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetHandle")
            .field("location", &self.location)
            .field("open", &self.owner.is_some())
            .finish()
    }
}

impl Drop for AssetHandle {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            if let Err(e) = owner.release() {
                error!("Failed to release asset handle: {}", e);
            }
        }
    }
}

/// Asset whose bytes are already in memory
#[derive(Clone)]
pub struct LocalAsset {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    fingerprint: Fingerprint,
    bytes: Bytes,
    open_count: Mutex<usize>,
}

impl LocalAsset {
    /// Wrap content, fingerprinting it with a filename or MIME hint
    pub fn new(bytes: impl Into<Bytes>, name_or_mime_hint: &str) -> Self {
        let bytes = bytes.into();
        let fingerprint = fingerprint_for(&bytes, name_or_mime_hint);
        Self {
            inner: Arc::new(LocalInner {
                fingerprint,
                bytes,
                open_count: Mutex::new(0),
            }),
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.inner.bytes
    }

    /// Reference to attach to a record before the content is uploaded
    pub fn reference(&self) -> AssetReference {
        AssetReference::pending(self.inner.fingerprint.clone())
    }
}

impl OpenCounter for LocalInner {
    fn release(&self) -> AssetResult<usize> {
        let mut count = self.open_count.lock();
        match count.checked_sub(1) {
            Some(remaining) => {
                *count = remaining;
                Ok(remaining)
            }
            None => {
                error!(fingerprint = %self.fingerprint, "Unbalanced open/close calls on asset");
                Err(AssetError::UnbalancedClose(self.fingerprint.to_string()))
            }
        }
    }
}

#[async_trait]
impl Asset for LocalAsset {
    fn fingerprint(&self) -> Option<&Fingerprint> {
        Some(&self.inner.fingerprint)
    }

    fn open_count(&self) -> usize {
        *self.inner.open_count.lock()
    }

    async fn open(&self) -> AssetResult<AssetHandle> {
        *self.inner.open_count.lock() += 1;
        let location = AssetLocation::Local {
            fingerprint: Some(self.inner.fingerprint.clone()),
            bytes: self.inner.bytes.clone(),
        };
        Ok(AssetHandle::new(location, self.inner.clone()))
    }

    async fn open_as_blob(&self) -> AssetResult<Bytes> {
        Ok(self.inner.bytes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_asset_open_close() {
        let asset = LocalAsset::new(b"content".to_vec(), "note.txt");
        assert_eq!(asset.open_count(), 0);

        let first = asset.open().await.unwrap();
        let second = asset.open().await.unwrap();
        assert_eq!(asset.open_count(), 2);
        assert!(matches!(first.location(), AssetLocation::Local { .. }));

        first.close().unwrap();
        assert_eq!(asset.open_count(), 1);

        drop(second);
        assert_eq!(asset.open_count(), 0);
    }

    #[tokio::test]
    async fn test_handle_released_on_error_path() {
        let asset = LocalAsset::new(b"content".to_vec(), "note.txt");

        async fn use_and_fail(asset: &LocalAsset) -> Result<(), String> {
            let _handle = asset.open().await.map_err(|e| e.to_string())?;
            Err("render failed".to_string())
        }

        assert!(use_and_fail(&asset).await.is_err());
        assert_eq!(asset.open_count(), 0);
    }

    #[test]
    fn test_unbalanced_release_is_reported() {
        let asset = LocalAsset::new(b"content".to_vec(), "note.txt");
        let result = asset.inner.release();
        assert!(matches!(result, Err(AssetError::UnbalancedClose(_))));
        assert_eq!(asset.open_count(), 0);
    }

    #[test]
    fn test_reference_wire_format() {
        let asset = LocalAsset::new(b"content".to_vec(), "image/png");
        let reference = asset
            .reference()
            .with_download_url("https://api.example.com/users/me/sync/assets/x")
            .uploaded();

        let json = serde_json::to_value(&reference).unwrap();
        assert_eq!(json["uploaded"], true);
        assert_eq!(
            json["downloadUrl"],
            "https://api.example.com/users/me/sync/assets/x"
        );
        assert!(json.get("presignedDownloadUrl").is_none());

        let back: AssetReference = serde_json::from_value(json).unwrap();
        assert_eq!(back, reference);
    }

    #[test]
    fn test_reference_expiry() {
        let fp = fingerprint_for(b"x", "a.png");
        let missing = AssetReference::pending(fp.clone());
        assert!(missing.has_expired());

        let stale = AssetReference::pending(fp.clone())
            .with_presigned_url("https://cdn.example.com/a.png?Expires=1000");
        assert!(stale.has_expired());

        let fresh = AssetReference::pending(fp)
            .with_presigned_url("https://cdn.example.com/a.png?Expires=4102444800");
        assert!(!fresh.has_expired());
    }
}
