//! Remote assets backed by short-lived presigned URLs.
//!
//! A `RemoteAsset` hands out presigned URLs that are never past their
//! embedded expiry. While at least one handle is open, a background task
//! refreshes the URL shortly before it expires and broadcasts the change so
//! consumers holding the old URL can swap over.

use super::expiry;
use super::{
    Asset, AssetError, AssetHandle, AssetLocation, AssetReference, AssetResult, AssetSource,
    Fingerprint, OpenCounter,
};
use crate::single_flight::SingleFlight;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

/// How long before expiry the background refresh fires, unless configured
pub const DEFAULT_REFRESH_LEAD: Duration = Duration::from_secs(30);

/// Lower bound between background refreshes
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

const EVENT_CAPACITY: usize = 16;

/// Broadcast when an asset's presigned URL changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlRefreshed {
    pub fingerprint: Fingerprint,
    /// Record the asset is attached to
    pub parent_id: Option<String>,
    pub previous: Option<Url>,
    pub current: Url,
}

/// An asset whose content lives behind the remote store's download endpoint
#[derive(Clone)]
pub struct RemoteAsset {
    inner: Arc<Inner>,
}

struct Inner {
    fingerprint: Fingerprint,
    parent_id: Option<String>,
    download_url: Option<String>,
    source: Arc<dyn AssetSource>,
    refresh_lead: Duration,
    state: Mutex<State>,
    refresh: SingleFlight<Url, AssetError>,
    events: broadcast::Sender<UrlRefreshed>,
}

struct State {
    presigned: Option<Url>,
    open_count: usize,
    scheduled: Option<ScheduledRefresh>,
    cached: Option<Bytes>,
}

/// Background refresh task; aborted when dropped
struct ScheduledRefresh(JoinHandle<()>);

impl ScheduledRefresh {
    fn is_active(&self) -> bool {
        !self.0.is_finished()
    }
}

impl Drop for ScheduledRefresh {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl RemoteAsset {
    pub fn new(
        reference: &AssetReference,
        parent_id: Option<String>,
        source: Arc<dyn AssetSource>,
        refresh_lead: Duration,
    ) -> Self {
        let presigned = reference
            .presigned_download_url
            .as_deref()
            .and_then(|raw| Url::parse(raw).ok());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                fingerprint: reference.fingerprint.clone(),
                parent_id,
                download_url: reference.download_url.clone(),
                source,
                refresh_lead,
                state: Mutex::new(State {
                    presigned,
                    open_count: 0,
                    scheduled: None,
                    cached: None,
                }),
                refresh: SingleFlight::new(),
                events,
            }),
        }
    }

    /// Seed already-known content, e.g. bytes that were just uploaded
    pub fn with_cached_bytes(self, bytes: Bytes) -> Self {
        self.inner.state.lock().cached = Some(bytes);
        self
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.inner.parent_id.as_deref()
    }

    pub fn presigned_url(&self) -> Option<Url> {
        self.inner.state.lock().presigned.clone()
    }

    /// Current reference state, including the latest presigned URL
    pub fn reference(&self) -> AssetReference {
        let mut reference = AssetReference::pending(self.inner.fingerprint.clone()).uploaded();
        reference.download_url = self.inner.download_url.clone();
        reference.presigned_download_url = self.presigned_url().map(String::from);
        reference
    }

    pub fn has_scheduled_refresh(&self) -> bool {
        self.inner
            .state
            .lock()
            .scheduled
            .as_ref()
            .map_or(false, ScheduledRefresh::is_active)
    }

    /// Observe presigned URL changes
    pub fn subscribe(&self) -> broadcast::Receiver<UrlRefreshed> {
        self.inner.events.subscribe()
    }

    /// A presigned URL that is not known to be expired, refreshing if needed
    pub async fn fresh_url(&self) -> AssetResult<Url> {
        let current = self.inner.state.lock().presigned.clone();
        match current {
            Some(url) if !expiry::has_expired(&url, Utc::now()) => Ok(url),
            _ => self.refresh_url().await,
        }
    }

    /// Fetch a new presigned URL; concurrent callers share one request
    pub async fn refresh_url(&self) -> AssetResult<Url> {
        let inner = self.inner.clone();
        self.inner
            .refresh
            .run(move || async move { inner.resolve().await })
            .await
    }

    fn schedule_refresh(&self, state: &mut State, url: &Url) {
        if state.scheduled.as_ref().map_or(false, ScheduledRefresh::is_active) {
            return;
        }
        let Some(delay) = refresh_delay(url, self.inner.refresh_lead) else {
            return;
        };

        debug!(fingerprint = %self.inner.fingerprint, delay_secs = delay.as_secs(), "Scheduling presigned URL refresh");
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(refresh_loop(weak, delay));
        state.scheduled = Some(ScheduledRefresh(handle));
    }
}

async fn refresh_loop(weak: Weak<Inner>, mut delay: Duration) {
    loop {
        tokio::time::sleep(delay).await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let asset = RemoteAsset { inner };
        match asset.refresh_url().await {
            Ok(url) => match refresh_delay(&url, asset.inner.refresh_lead) {
                Some(next) => delay = next,
                None => break,
            },
            Err(e) => {
                warn!(fingerprint = %asset.inner.fingerprint, "Scheduled URL refresh failed: {}", e);
                break;
            }
        }
    }
}

/// Time until the refresh should fire, or `None` for URLs without an expiry
fn refresh_delay(url: &Url, lead: Duration) -> Option<Duration> {
    let expiry = expiry::expiry_from_url(url)?;
    let remaining = (expiry - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Some(remaining.saturating_sub(lead).max(MIN_REFRESH_INTERVAL))
}

impl Inner {
    async fn resolve(&self) -> AssetResult<Url> {
        let download_url = self
            .download_url
            .as_deref()
            .ok_or(AssetError::MissingDownloadUrl)?;

        debug!(fingerprint = %self.fingerprint, "Refreshing presigned URL");
        let url = self.source.resolve_presigned_url(download_url).await?;

        let previous = self.state.lock().presigned.replace(url.clone());
        if previous.as_ref() != Some(&url) {
            info!(fingerprint = %self.fingerprint, "Presigned URL refreshed");
            // No receivers is fine
            let _ = self.events.send(UrlRefreshed {
                fingerprint: self.fingerprint.clone(),
                parent_id: self.parent_id.clone(),
                previous,
                current: url.clone(),
            });
        }
        Ok(url)
    }
}

impl OpenCounter for Inner {
    fn release(&self) -> AssetResult<usize> {
        let mut state = self.state.lock();
        match state.open_count.checked_sub(1) {
            Some(remaining) => {
                state.open_count = remaining;
                if remaining == 0 && state.scheduled.take().is_some() {
                    debug!(fingerprint = %self.fingerprint, "Cancelled scheduled URL refresh");
                }
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
impl Asset for RemoteAsset {
    fn fingerprint(&self) -> Option<&Fingerprint> {
        Some(&self.inner.fingerprint)
    }

    fn open_count(&self) -> usize {
        self.inner.state.lock().open_count
    }

    async fn open(&self) -> AssetResult<AssetHandle> {
        {
            let mut state = self.inner.state.lock();
            if let Some(bytes) = state.cached.clone() {
                state.open_count += 1;
                let location = AssetLocation::Local {
                    fingerprint: Some(self.inner.fingerprint.clone()),
                    bytes,
                };
                return Ok(AssetHandle::new(location, self.inner.clone()));
            }
        }

        let url = self.fresh_url().await?;

        let mut state = self.inner.state.lock();
        state.open_count += 1;
        self.schedule_refresh(&mut state, &url);
        Ok(AssetHandle::new(
            AssetLocation::Remote(url),
            self.inner.clone(),
        ))
    }

    async fn open_as_blob(&self) -> AssetResult<Bytes> {
        let handle = self.open().await?;
        let bytes = match handle.location() {
            AssetLocation::Local { bytes, .. } => bytes.clone(),
            AssetLocation::Remote(url) => {
                let bytes = self.inner.source.fetch(url).await?;
                self.inner.state.lock().cached = Some(bytes.clone());
                bytes
            }
        };
        handle.close()?;
        Ok(bytes)
    }
}
