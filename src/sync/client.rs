//! Sync client: authenticated requests, batched record posts, paginated
//! listing and multi-part asset upload against the remote store.

use super::auth::TokenManager;
use super::protocol::{
    self, BatchRequest, BatchResponse, CompleteUploadRequest, IdsRequest, InitiateUploadRequest,
    PageCursor, RecordPage, UploadPlan, EXPUNGE_PATH, RECORDS_BY_ID_PATH, RECORDS_PATH,
    SYNC_BASE_PATH,
};
use super::transport::{send_cancellable, HttpRequest, HttpResponse, ReqwestTransport, Transport};
use super::{ClientConfig, SyncError, SyncResult};
use crate::asset::{
    AssetError, AssetReference, AssetResult, AssetSource, Fingerprint, RemoteAsset,
};
use crate::record::property::format_wire_time;
use crate::record::{CollectionType, PropertyKey, Record, RecordWire, SyncState};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures_util::stream::{self, Stream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Slots tried, in order, when eagerly resolving download URLs
const DOWNLOAD_SLOTS: [&str; 3] = ["thumbnail", "content", "mask"];

/// Outcome of one record within a batch post
pub type PostOutcome = SyncResult<Option<Record>>;

/// Options for listing a collection
#[derive(Debug, Clone)]
pub struct ListOptions {
    /// Keep `deleted` and `trashed` records
    pub include_trashed: bool,
    /// Ask the server to embed presigned URLs in asset references
    pub presigned_urls: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            include_trashed: false,
            presigned_urls: true,
        }
    }
}

impl ListOptions {
    pub fn with_trashed(mut self) -> Self {
        self.include_trashed = true;
        self
    }
}

/// Progress of a multi-part upload, reported after each part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub bytes_sent: u64,
    pub total_bytes: u64,
}

/// Callback invoked with upload progress
pub type ProgressFn<'a> = &'a (dyn Fn(&Fingerprint, UploadProgress) + Send + Sync);

/// Result of driving a set of records through a post
#[derive(Debug, Default)]
pub struct SyncSummary {
    pub synced: usize,
    /// Per-record rejections; the records stay dirty
    pub failed: Vec<SyncError>,
}

/// Client for one remote store environment
#[derive(Clone)]
pub struct SyncClient {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    tokens: TokenManager,
}

impl SyncClient {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> SyncResult<Self> {
        config.validate()?;
        let tokens = TokenManager::new(&config, transport.clone())?;
        Ok(Self {
            config,
            transport,
            tokens,
        })
    }

    /// Create a client backed by reqwest
    pub fn with_reqwest(config: ClientConfig) -> SyncResult<Self> {
        let transport = ReqwestTransport::new(config.request_timeout)?;
        Self::new(config, Arc::new(transport))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// Send with the current token; on an auth failure refresh once and retry once
    pub async fn authenticated(
        &self,
        request: HttpRequest,
        cancel: Option<&CancellationToken>,
    ) -> SyncResult<HttpResponse> {
        let token = self.tokens.valid_token().await?;
        let response = send_cancellable(
            self.transport.as_ref(),
            request.clone().bearer(&token.id_token),
            cancel,
        )
        .await?;
        if !protocol::is_auth_failure(response.status, &response.body) {
            return Ok(response);
        }

        warn!(url = %request.url, status = response.status, "Request was not authorized; refreshing token and retrying");
        let token = self.tokens.refresh().await?;
        let response = send_cancellable(
            self.transport.as_ref(),
            request.bearer(&token.id_token),
            cancel,
        )
        .await?;
        if protocol::is_auth_failure(response.status, &response.body) {
            let message = protocol::error_message(&response.body)
                .unwrap_or_else(|| format!("HTTP {}", response.status));
            warn!("Request still unauthorized after token refresh: {}", message);
            return Err(SyncError::Unauthorized(message));
        }
        Ok(response)
    }

    // Records

    /// Post records in fixed-size batches, strictly in order.
    ///
    /// A transport or protocol failure aborts the remaining batches.
    /// Per-record rejections are returned positionally.
    pub async fn post_records(
        &self,
        records: Vec<RecordWire>,
        cancel: Option<&CancellationToken>,
    ) -> SyncResult<Vec<PostOutcome>> {
        let mut outcomes = Vec::with_capacity(records.len());
        for batch in records.chunks(self.config.batch_size) {
            outcomes.extend(self.post_batch(batch, cancel).await?);
        }
        Ok(outcomes)
    }

    async fn post_batch(
        &self,
        batch: &[RecordWire],
        cancel: Option<&CancellationToken>,
    ) -> SyncResult<Vec<PostOutcome>> {
        let body = BatchRequest {
            now: format_wire_time(&Utc::now()),
            records: batch.to_vec(),
        };
        let request =
            HttpRequest::post(self.config.endpoint(RECORDS_PATH)?).json(serde_json::to_value(&body)?);

        info!(count = batch.len(), "Posting record batch");
        let response = self.authenticated(request, cancel).await?.error_for_status()?;
        let decoded: BatchResponse = response.decode()?;
        let results = decoded
            .results
            .ok_or_else(|| SyncError::protocol("Batch response without results", &response.body))?;
        if results.len() != batch.len() {
            return Err(SyncError::protocol(
                format!("Expected {} results, got {}", batch.len(), results.len()),
                &response.body,
            ));
        }

        Ok(batch
            .iter()
            .zip(results)
            .map(|(sent, result)| match result.failure() {
                Some(reason) => {
                    warn!(record_id = %sent.id, "Record rejected: {}", reason);
                    Err(SyncError::RecordRejected {
                        id: sent.id.clone(),
                        reason,
                    })
                }
                None => Ok(result.record.map(Record::from_wire)),
            })
            .collect())
    }

    /// Post a single record, returning the server's copy if it sent one
    pub async fn post_record(&self, record: &Record) -> SyncResult<Option<Record>> {
        self.post_records(vec![record.to_wire()], None)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::protocol("Empty batch result", record.id().as_bytes()))?
    }

    /// Post every dirty or never-posted record and fold the results back in
    pub async fn sync_records(
        &self,
        records: &mut [Record],
        cancel: Option<&CancellationToken>,
    ) -> SyncResult<SyncSummary> {
        let pending: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                *r.state() != SyncState::Expunged
                    && (r.is_dirty()
                        || matches!(r.state(), SyncState::LocalOnly | SyncState::Failed { .. }))
            })
            .map(|(index, _)| index)
            .collect();

        let mut summary = SyncSummary::default();
        for chunk in pending.chunks(self.config.batch_size) {
            let wires: Vec<RecordWire> = chunk.iter().map(|&i| records[i].begin_post()).collect();
            let outcomes = match self.post_batch(&wires, cancel).await {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    for &i in chunk {
                        records[i].fail_post(e.to_string());
                    }
                    return Err(e);
                }
            };

            for (&i, outcome) in chunk.iter().zip(outcomes) {
                match outcome {
                    Ok(server) => {
                        records[i].finish_post(server.as_ref());
                        summary.synced += 1;
                    }
                    Err(e) => {
                        records[i].fail_post(e.to_string());
                        summary.failed.push(e);
                    }
                }
            }
        }

        debug!(synced = summary.synced, failed = summary.failed.len(), "Record sync finished");
        Ok(summary)
    }

    pub async fn fetch_records_by_id(
        &self,
        ids: &[String],
        include_trashed: bool,
    ) -> SyncResult<Vec<Record>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut url = self.config.endpoint(RECORDS_BY_ID_PATH)?;
        url.query_pairs_mut()
            .append_pair("include_trashed", &include_trashed.to_string());
        let body = IdsRequest { ids: ids.to_vec() };
        let request = HttpRequest::post(url).json(serde_json::to_value(&body)?);

        let response = self.authenticated(request, None).await?.error_for_status()?;
        let page: RecordPage = response.decode()?;
        let records = page.decode_records();
        Ok(if include_trashed {
            records
        } else {
            records.into_iter().filter(|r| !r.is_trashed()).collect()
        })
    }

    async fn fetch_page(
        &self,
        collection: &CollectionType,
        options: &ListOptions,
        token: Option<&str>,
    ) -> SyncResult<(Vec<Record>, Option<String>)> {
        let mut url = self
            .config
            .endpoint(&format!("{}/records/{}", SYNC_BASE_PATH, collection))?;
        {
            let mut query = url.query_pairs_mut();
            if options.presigned_urls {
                query.append_pair("presignedURLs", "true");
            }
            query.append_pair("include_trashed", &options.include_trashed.to_string());
            if let Some(token) = token {
                query.append_pair("nextPageToken", token);
            }
        }

        let response = self
            .authenticated(HttpRequest::get(url), None)
            .await?
            .error_for_status()?;
        let page: RecordPage = response.decode()?;
        let next = page.next_page_token.clone();
        let mut records = page.decode_records();
        if !options.include_trashed {
            records.retain(|r| !r.is_trashed());
        }
        debug!(%collection, count = records.len(), has_next = next.is_some(), "Fetched record page");
        Ok((records, next))
    }

    /// Pages of a collection listing; ends on an absent, empty or repeated token
    pub fn record_pages<'a>(
        &'a self,
        collection: CollectionType,
        options: ListOptions,
    ) -> impl Stream<Item = SyncResult<Vec<Record>>> + 'a {
        stream::unfold(Some(PageCursor::new()), move |cursor| {
            let collection = collection.clone();
            let options = options.clone();
            async move {
                let Some(mut cursor) = cursor else {
                    return None;
                };
                match self.fetch_page(&collection, &options, cursor.token()).await {
                    Ok((records, next)) => {
                        let more = cursor.advance(next);
                        Some((Ok(records), more.then_some(cursor)))
                    }
                    Err(e) => Some((Err(e), None)),
                }
            }
        })
    }

    /// Every record in a collection, across all pages
    pub async fn list_records(
        &self,
        collection: CollectionType,
        options: ListOptions,
    ) -> SyncResult<Vec<Record>> {
        let pages = self.record_pages(collection, options);
        futures_util::pin_mut!(pages);

        let mut records = Vec::new();
        while let Some(page) = pages.next().await {
            records.extend(page?);
        }
        Ok(records)
    }

    // Trash

    /// Soft-delete records by setting `trashed` and posting them
    pub async fn trash_records(
        &self,
        records: &mut [Record],
        cancel: Option<&CancellationToken>,
    ) -> SyncResult<SyncSummary> {
        for record in records.iter_mut() {
            record.set_property(PropertyKey::Trashed, true);
        }
        self.sync_records(records, cancel).await
    }

    pub async fn untrash_records(
        &self,
        records: &mut [Record],
        cancel: Option<&CancellationToken>,
    ) -> SyncResult<SyncSummary> {
        for record in records.iter_mut() {
            record.set_property(PropertyKey::Trashed, false);
        }
        self.sync_records(records, cancel).await
    }

    /// Permanently remove previously trashed records
    pub async fn expunge_records(&self, ids: &[String]) -> SyncResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let body = IdsRequest { ids: ids.to_vec() };
        let request =
            HttpRequest::post(self.config.endpoint(EXPUNGE_PATH)?).json(serde_json::to_value(&body)?);
        self.authenticated(request, None).await?.error_for_status()?;
        info!(count = ids.len(), "Expunged records");
        Ok(())
    }

    /// Expunge the trashed records among `records`; returns how many were removed
    pub async fn expunge_trashed(&self, records: &mut [Record]) -> SyncResult<usize> {
        let ids: Vec<String> = records
            .iter()
            .filter(|r| r.is_trashed() && *r.state() != SyncState::Expunged)
            .map(|r| r.id().to_string())
            .collect();
        self.expunge_records(&ids).await?;
        for record in records.iter_mut().filter(|r| ids.iter().any(|id| id == r.id())) {
            record.mark_expunged();
        }
        Ok(ids.len())
    }

    // Assets

    /// Multi-part upload of one blob; marks the reference uploaded on success
    pub async fn upload_asset(
        &self,
        reference: &mut AssetReference,
        data: Bytes,
        progress: Option<ProgressFn<'_>>,
        cancel: Option<&CancellationToken>,
    ) -> SyncResult<()> {
        if reference.uploaded {
            return Ok(());
        }
        let fingerprint = reference.fingerprint.clone();
        let initiate = reference.initiate_upload_url.as_deref().ok_or_else(|| {
            SyncError::UploadFailed(format!("No initiate upload URL for {}", fingerprint))
        })?;
        let content_type = fingerprint
            .mime_type()
            .unwrap_or("application/octet-stream")
            .to_string();

        let request = HttpRequest::post(self.config.endpoint(initiate)?).json(serde_json::to_value(
            &InitiateUploadRequest {
                content_type: content_type.clone(),
            },
        )?);
        let response = self.authenticated(request, cancel).await?.error_for_status()?;
        let plan: UploadPlan = response.decode()?;
        let complete = plan.complete_upload_url.as_deref().ok_or_else(|| {
            SyncError::protocol("Upload plan without completeUploadUrl", &response.body)
        })?;

        let total_bytes = data.len() as u64;
        let mut bytes_sent = 0u64;
        let mut complete_request = CompleteUploadRequest::default();
        for (index, part) in plan.parts.iter().enumerate() {
            let range = part.range(data.len());
            let length = range.len() as u64;
            debug!(%fingerprint, part = index, bytes = length, "Uploading part");

            // Part URLs are presigned; no bearer token
            let request = HttpRequest::put(self.config.endpoint(&part.url)?)
                .bytes(data.slice(range), content_type.clone());
            let response = send_cancellable(self.transport.as_ref(), request, cancel).await?;
            if !response.is_success() {
                return Err(SyncError::UploadFailed(format!(
                    "Part {} of {} failed with status {}",
                    index, fingerprint, response.status
                )));
            }
            let etag = response.header("etag").ok_or_else(|| {
                SyncError::protocol(format!("Part {} response without ETag", index), &response.body)
            })?;
            complete_request
                .etags
                .insert(index.to_string(), etag.to_string());

            bytes_sent += length;
            if let Some(progress) = progress {
                progress(
                    &fingerprint,
                    UploadProgress {
                        bytes_sent,
                        total_bytes,
                    },
                );
            }
        }

        let request = HttpRequest::put(self.config.endpoint(complete)?)
            .json(serde_json::to_value(&complete_request)?);
        let response = self.authenticated(request, cancel).await?;
        if !response.is_success() {
            return Err(SyncError::UploadFailed(format!(
                "Completing upload of {} failed with status {}",
                fingerprint, response.status
            )));
        }
        reference.uploaded = true;
        info!(%fingerprint, bytes = total_bytes, parts = plan.parts.len(), "Uploaded asset");

        if let Some(download_url) = reference.download_url.clone() {
            match self.presigned_url_for(&download_url).await {
                Ok(url) => reference.presigned_download_url = Some(url.to_string()),
                Err(e) => warn!(%fingerprint, "Could not resolve presigned URL after upload: {}", e),
            }
        }
        Ok(())
    }

    /// Upload every not-yet-uploaded reference on `record` whose bytes are in `blobs`
    pub async fn upload_assets(
        &self,
        record: &mut Record,
        blobs: &HashMap<Fingerprint, Bytes>,
        progress: Option<ProgressFn<'_>>,
        cancel: Option<&CancellationToken>,
    ) -> SyncResult<usize> {
        let pending: Vec<AssetReference> = record
            .asset_references()
            .iter()
            .filter(|r| !r.uploaded)
            .cloned()
            .collect();

        let mut uploaded = 0;
        for mut reference in pending {
            let Some(data) = blobs.get(&reference.fingerprint) else {
                debug!(record_id = %record.id(), fingerprint = %reference.fingerprint, "No local bytes for pending asset");
                continue;
            };
            self.upload_asset(&mut reference, data.clone(), progress, cancel)
                .await?;
            record.update_asset_reference(reference);
            uploaded += 1;
        }
        Ok(uploaded)
    }

    /// Create a record and upload its blobs; a record whose blobs fail to upload is removed again
    pub async fn create_record_with_assets(
        &self,
        record: &mut Record,
        blobs: &HashMap<Fingerprint, Bytes>,
        progress: Option<ProgressFn<'_>>,
        cancel: Option<&CancellationToken>,
    ) -> SyncResult<()> {
        let mut summary = self
            .sync_records(std::slice::from_mut(record), cancel)
            .await?;
        if let Some(e) = summary.failed.pop() {
            return Err(e);
        }

        if let Err(e) = self.upload_assets(record, blobs, progress, cancel).await {
            warn!(record_id = %record.id(), "Asset upload failed; deleting the orphaned record: {}", e);
            self.delete_orphan(record).await;
            return Err(e);
        }
        Ok(())
    }

    async fn delete_orphan(&self, record: &mut Record) {
        let trashed = self
            .trash_records(std::slice::from_mut(record), None)
            .await
            .map(|summary| summary.failed.is_empty());
        match trashed {
            Ok(true) => {}
            Ok(false) => {
                error!(record_id = %record.id(), "Could not trash orphaned record");
                return;
            }
            Err(e) => {
                error!(record_id = %record.id(), "Could not trash orphaned record: {}", e);
                return;
            }
        }
        match self.expunge_records(&[record.id().to_string()]).await {
            Ok(()) => record.mark_expunged(),
            Err(e) => error!(record_id = %record.id(), "Could not expunge orphaned record: {}", e),
        }
    }

    /// Public PUT of a thumbnail to a presigned URL, retried on failure
    pub async fn upload_thumbnail(
        &self,
        url: &Url,
        data: Bytes,
        content_type: &str,
    ) -> SyncResult<()> {
        let attempts = self.config.thumbnail_upload_attempts;
        let mut last_error = SyncError::UploadFailed("No upload attempts were made".to_string());
        for attempt in 1..=attempts {
            let request = HttpRequest::put(url.clone()).bytes(data.clone(), content_type);
            match self.transport.send(request).await {
                Ok(response) if (200..=300).contains(&response.status) => {
                    debug!(attempt, "Uploaded thumbnail");
                    return Ok(());
                }
                Ok(response) => {
                    warn!(attempt, status = response.status, "Thumbnail upload failed");
                    last_error = SyncError::UploadFailed(format!(
                        "Thumbnail upload failed with status {}",
                        response.status
                    ));
                }
                Err(e) => {
                    warn!(attempt, "Thumbnail upload failed: {}", e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Exchange a stable download URL for a presigned one
    pub async fn presigned_url_for(&self, download_url: &str) -> SyncResult<Url> {
        let request = HttpRequest::get(self.config.endpoint(download_url)?);
        let response = self.authenticated(request, None).await?;
        if !response.is_ok_or_redirect() {
            return Err(AssetError::RefreshFailed {
                status: response.status,
            }
            .into());
        }
        let raw = protocol::parse_presigned_body(&response.body);
        Url::parse(&raw).map_err(|_| AssetError::InvalidUrl(raw).into())
    }

    /// Resolve presigned URLs for the first resolvable display slot of each record.
    ///
    /// Returns the number of references that were refreshed.
    pub async fn resolve_download_urls(&self, records: &mut [Record]) -> usize {
        let user_id = self.tokens.current().and_then(|t| t.user_id);
        let mut resolved = 0;

        for record in records.iter_mut() {
            for slot in DOWNLOAD_SLOTS {
                let reference = match &user_id {
                    Some(user_id) => {
                        record.resolve_asset_reference(slot, &self.config.base_url, user_id)
                    }
                    None => record.asset_reference(slot, true).cloned(),
                };
                let Some(reference) = reference else {
                    continue;
                };
                if !reference.has_expired() {
                    break;
                }
                let Some(download_url) = reference.download_url.clone() else {
                    continue;
                };
                match self.presigned_url_for(&download_url).await {
                    Ok(url) => {
                        record.update_asset_reference(reference.with_presigned_url(url));
                        resolved += 1;
                        break;
                    }
                    Err(e) => {
                        warn!(record_id = %record.id(), slot, "Could not resolve download URL: {}", e)
                    }
                }
            }
        }
        resolved
    }

    /// A remote asset whose URL refreshes go through this client
    pub fn remote_asset(&self, reference: &AssetReference, parent_id: Option<String>) -> RemoteAsset {
        RemoteAsset::new(
            reference,
            parent_id,
            Arc::new(self.clone()),
            self.config.url_refresh_lead,
        )
    }
}

#[async_trait]
impl AssetSource for SyncClient {
    async fn resolve_presigned_url(&self, download_url: &str) -> AssetResult<Url> {
        self.presigned_url_for(download_url)
            .await
            .map_err(|e| match e {
                SyncError::Asset(asset) => asset,
                other => AssetError::Source(other.to_string()),
            })
    }

    async fn fetch(&self, url: &Url) -> AssetResult<Bytes> {
        let response = self
            .transport
            .send(HttpRequest::get(url.clone()))
            .await
            .map_err(|e| AssetError::Source(e.to_string()))?;
        if !response.is_success() {
            return Err(AssetError::Source(format!(
                "Download failed with status {}",
                response.status
            )));
        }
        Ok(response.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{fingerprint_for, Asset};
    use crate::sync::auth::AccessToken;
    use crate::sync::transport::mock::MockTransport;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BASE: &str = "https://api.example.com";

    fn config() -> ClientConfig {
        ClientConfig::new(Url::parse(BASE).unwrap(), "client-1", "hash-1")
    }

    fn signed_in(transport: Arc<MockTransport>) -> SyncClient {
        let client = SyncClient::new(config(), transport).unwrap();
        client.tokens().sign_in_with(
            AccessToken::new("token-1", "refresh-1")
                .with_expiry(Utc::now() + chrono::Duration::hours(1))
                .with_user("u1"),
        );
        client
    }

    fn echo_batch(request: &HttpRequest) -> HttpResponse {
        let records = request.json_body().unwrap()["records"].as_array().unwrap().clone();
        let results: Vec<Value> = records
            .into_iter()
            .map(|record| json!({"status": {"success": true}, "record": record}))
            .collect();
        HttpResponse::json(200, &json!({ "results": results }))
    }

    fn page(record: &Record) -> Record {
        let mut record = record.clone();
        record.set_property(PropertyKey::Title, "hello");
        record
    }

    fn dirty_records(count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| page(&Record::with_id(format!("r{}", i), CollectionType::Page, None)))
            .collect()
    }

    #[tokio::test]
    async fn test_batches_of_twenty_in_order() {
        let transport = MockTransport::new(|req| Ok(echo_batch(req))).shared();
        let client = signed_in(transport.clone());
        let mut records = dirty_records(47);

        let summary = client.sync_records(&mut records, None).await.unwrap();
        assert_eq!(summary.synced, 47);
        assert!(summary.failed.is_empty());

        let sizes: Vec<usize> = transport
            .requests()
            .iter()
            .map(|r| r.json_body().unwrap()["records"].as_array().unwrap().len())
            .collect();
        assert_eq!(sizes, vec![20, 20, 7]);

        let first_ids: Vec<String> = transport
            .requests()
            .iter()
            .map(|r| r.json_body().unwrap()["records"][0]["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(first_ids, vec!["r0", "r20", "r40"]);
        assert!(records.iter().all(|r| *r.state() == SyncState::Synced && !r.is_dirty()));
    }

    #[tokio::test]
    async fn test_result_count_mismatch_is_protocol_error() {
        let transport = MockTransport::new(|_| {
            Ok(HttpResponse::json(200, &json!({"results": [{"status": {"success": true}}]})))
        })
        .shared();
        let client = signed_in(transport);
        let mut records = dirty_records(2);

        let err = client.sync_records(&mut records, None).await.unwrap_err();
        match err {
            SyncError::Protocol { response, .. } => assert!(response.contains("results")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(records
            .iter()
            .all(|r| matches!(r.state(), SyncState::Failed { .. }) && r.is_dirty()));
    }

    #[tokio::test]
    async fn test_missing_results_is_protocol_error() {
        let transport = MockTransport::new(|_| Ok(HttpResponse::json(200, &json!({"results": null})))).shared();
        let client = signed_in(transport);
        let outcome = client.post_records(vec![dirty_records(1)[0].to_wire()], None).await;
        assert!(matches!(outcome, Err(SyncError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_rejected_record_is_surfaced() {
        let transport = MockTransport::new(|req| {
            let records = req.json_body().unwrap()["records"].as_array().unwrap().clone();
            Ok(HttpResponse::json(
                200,
                &json!({"results": [
                    {"status": {"success": true}, "record": records[0]},
                    {"status": {"success": false, "errorMessage": "version conflict"}}
                ]}),
            ))
        })
        .shared();
        let client = signed_in(transport);
        let mut records = dirty_records(2);

        let summary = client.sync_records(&mut records, None).await.unwrap();
        assert_eq!(summary.synced, 1);
        assert_eq!(
            summary.failed,
            vec![SyncError::RecordRejected {
                id: "r1".into(),
                reason: "version conflict".into()
            }]
        );
        assert_eq!(*records[0].state(), SyncState::Synced);
        assert!(records[1].is_dirty());
    }

    #[tokio::test]
    async fn test_clean_records_are_not_posted() {
        let transport = MockTransport::new(|req| Ok(echo_batch(req))).shared();
        let client = signed_in(transport.clone());
        let mut records = dirty_records(3);
        client.sync_records(&mut records, None).await.unwrap();

        let summary = client.sync_records(&mut records, None).await.unwrap();
        assert_eq!(summary.synced, 0);
        assert_eq!(transport.count(RECORDS_PATH), 1);
    }

    #[tokio::test]
    async fn test_expunged_records_are_not_posted() {
        let transport = MockTransport::new(|req| Ok(echo_batch(req))).shared();
        let client = signed_in(transport.clone());
        let mut records = dirty_records(2);
        records[0].mark_expunged();

        let summary = client.sync_records(&mut records, None).await.unwrap();
        assert_eq!(summary.synced, 1);
        assert_eq!(*records[0].state(), SyncState::Expunged);
        let posted = transport.requests()[0].json_body().unwrap()["records"].clone();
        assert_eq!(posted.as_array().unwrap().len(), 1);
        assert_eq!(posted[0]["id"], "r1");
    }

    #[tokio::test]
    async fn test_auth_failure_refreshes_and_retries_once() {
        let transport = MockTransport::new(|req| {
            if req.url.path() == "/auth/tokens/refresh" {
                return Ok(HttpResponse::json(200, &json!({"idToken": "token-2", "expiresIn": 3600})));
            }
            let auth = req
                .headers
                .iter()
                .find(|(name, _)| name == "Authorization")
                .map(|(_, value)| value.clone())
                .unwrap_or_default();
            if auth == "Bearer token-1" {
                Ok(HttpResponse::json(200, &json!({"message": "The incoming token has expired"})))
            } else {
                Ok(echo_batch(req))
            }
        })
        .shared();
        let client = signed_in(transport.clone());

        let server = client.post_record(&dirty_records(1)[0]).await.unwrap();
        assert_eq!(server.unwrap().id(), "r0");
        assert_eq!(transport.count("/auth/tokens/refresh"), 1);
        assert_eq!(transport.count(RECORDS_PATH), 2);
    }

    #[tokio::test]
    async fn test_second_auth_failure_is_not_retried() {
        let transport = MockTransport::new(|req| {
            if req.url.path() == "/auth/tokens/refresh" {
                return Ok(HttpResponse::json(200, &json!({"idToken": "token-2"})));
            }
            Ok(HttpResponse::json(403, &json!({"Message": "Unauthorized"})))
        })
        .shared();
        let client = signed_in(transport.clone());

        let err = client.expunge_records(&["a".to_string()]).await.unwrap_err();
        assert_eq!(err, SyncError::Unauthorized("Unauthorized".into()));
        assert_eq!(transport.count(EXPUNGE_PATH), 2);
        assert_eq!(transport.count("/auth/tokens/refresh"), 1);
    }

    #[tokio::test]
    async fn test_pagination_follows_tokens() {
        let transport = MockTransport::new(|req| {
            let token = req
                .url
                .query_pairs()
                .find(|(k, _)| k == "nextPageToken")
                .map(|(_, v)| v.into_owned());
            let body = match token.as_deref() {
                None => json!({"records": [{"id": "a", "collection": "page"}], "nextPageToken": "t1"}),
                Some("t1") => json!({"records": [{"id": "b", "collection": "page"}], "nextPageToken": ""}),
                Some(other) => panic!("unexpected token {}", other),
            };
            Ok(HttpResponse::json(200, &body))
        })
        .shared();
        let client = signed_in(transport.clone());

        let records = client
            .list_records(CollectionType::Page, ListOptions::default())
            .await
            .unwrap();
        let ids: Vec<&str> = records.iter().map(Record::id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let first = &transport.requests()[0];
        assert_eq!(first.url.path(), "/users/me/sync/records/page");
        assert!(first.url.query().unwrap().contains("presignedURLs=true"));
    }

    #[tokio::test]
    async fn test_repeated_page_token_terminates() {
        let transport = MockTransport::new(|_| {
            Ok(HttpResponse::json(
                200,
                &json!({"records": [{"id": "a", "collection": "page"}], "nextPageToken": "same"}),
            ))
        })
        .shared();
        let client = signed_in(transport.clone());

        let records = client
            .list_records(CollectionType::Page, ListOptions::default())
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_listing_drops_trashed_unless_asked() {
        let transport = MockTransport::new(|_| {
            Ok(HttpResponse::json(
                200,
                &json!({"records": [
                    {"id": "a", "collection": "page"},
                    {"id": "b", "collection": "page", "deleted": true},
                    {"id": "c", "collection": "page", "properties": {
                        "trashed": {"value": true, "clientUpdatedTime": "2022-04-25T17:15:09Z"}
                    }}
                ]}),
            ))
        })
        .shared();
        let client = signed_in(transport);

        let live = client
            .list_records(CollectionType::Page, ListOptions::default())
            .await
            .unwrap();
        assert_eq!(live.len(), 1);

        let all = client
            .list_records(CollectionType::Page, ListOptions::default().with_trashed())
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_by_id() {
        let transport = MockTransport::new(|req| {
            assert_eq!(req.json_body().unwrap()["ids"], json!(["a", "b"]));
            Ok(HttpResponse::json(
                200,
                &json!({"records": [{"id": "a", "collection": "page"}, {"id": "b", "collection": "media"}]}),
            ))
        })
        .shared();
        let client = signed_in(transport.clone());

        let records = client
            .fetch_records_by_id(&["a".into(), "b".into()], true)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(*records[1].collection(), CollectionType::Media);
        assert!(transport.requests()[0]
            .url
            .query()
            .unwrap()
            .contains("include_trashed=true"));

        assert!(client.fetch_records_by_id(&[], true).await.unwrap().is_empty());
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_trash_then_expunge() {
        let transport = MockTransport::new(|req| {
            if req.url.path() == EXPUNGE_PATH {
                return Ok(HttpResponse::new(200, "{}"));
            }
            Ok(echo_batch(req))
        })
        .shared();
        let client = signed_in(transport.clone());
        let mut records = dirty_records(2);
        client.sync_records(&mut records, None).await.unwrap();

        client.trash_records(&mut records[..1], None).await.unwrap();
        assert_eq!(*records[0].state(), SyncState::Trashed);

        let removed = client.expunge_trashed(&mut records).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(*records[0].state(), SyncState::Expunged);
        assert_eq!(*records[1].state(), SyncState::Synced);

        let expunge = transport
            .requests()
            .into_iter()
            .find(|r| r.url.path() == EXPUNGE_PATH)
            .unwrap();
        assert_eq!(expunge.json_body().unwrap(), &json!({"ids": ["r0"]}));
    }

    fn upload_transport(fail_part: bool) -> Arc<MockTransport> {
        MockTransport::new(move |req| {
            let path = req.url.path().to_string();
            match path.as_str() {
                "/assets/initiate" => Ok(HttpResponse::json(
                    200,
                    &json!({
                        "parts": [
                            {"byteRangeStart": 0, "byteRangeLength": 6, "url": "https://s3.example.com/p0"},
                            {"byteRangeStart": 6, "byteRangeLength": 4, "url": "https://s3.example.com/p1"}
                        ],
                        "completeUploadUrl": "/assets/complete"
                    }),
                )),
                "/p0" => Ok(HttpResponse::new(200, "").with_header("ETag", "\"e0\"")),
                "/p1" if fail_part => Ok(HttpResponse::new(500, "")),
                "/p1" => Ok(HttpResponse::new(200, "").with_header("ETag", "\"e1\"")),
                "/assets/complete" => Ok(HttpResponse::new(200, "")),
                "/assets/download" => Ok(HttpResponse::new(
                    200,
                    "\"https://cdn.example.com/blob?Expires=4102444800\"",
                )),
                p if p == RECORDS_PATH => Ok(echo_batch(req)),
                p if p == EXPUNGE_PATH => Ok(HttpResponse::new(200, "{}")),
                other => panic!("unexpected path {}", other),
            }
        })
        .shared()
    }

    fn pending_reference(data: &[u8]) -> AssetReference {
        let mut reference = AssetReference::pending(fingerprint_for(data, "image/png"));
        reference.initiate_upload_url = Some("/assets/initiate".into());
        reference.download_url = Some("/assets/download".into());
        reference
    }

    #[tokio::test]
    async fn test_multipart_upload() {
        let transport = upload_transport(false);
        let client = signed_in(transport.clone());
        let data = Bytes::from_static(b"0123456789");
        let mut reference = pending_reference(&data);

        let seen = Mutex::new(Vec::new());
        let progress = |_: &Fingerprint, p: UploadProgress| seen.lock().push(p.bytes_sent);
        client
            .upload_asset(&mut reference, data, Some(&progress), None)
            .await
            .unwrap();

        assert!(reference.uploaded);
        assert_eq!(
            reference.presigned_download_url.as_deref(),
            Some("https://cdn.example.com/blob?Expires=4102444800")
        );
        assert_eq!(*seen.lock(), vec![6, 10]);

        let requests = transport.requests();
        let part = requests.iter().find(|r| r.url.path() == "/p1").unwrap();
        assert!(part.headers.iter().all(|(name, _)| name != "Authorization"));
        match &part.body {
            crate::sync::transport::RequestBody::Bytes { data, content_type } => {
                assert_eq!(&data[..], b"6789");
                assert_eq!(content_type, "image/png");
            }
            other => panic!("unexpected body {:?}", other),
        }
        let complete = requests
            .iter()
            .find(|r| r.url.path() == "/assets/complete")
            .unwrap();
        assert_eq!(
            complete.json_body().unwrap(),
            &json!({"etags": {"0": "\"e0\"", "1": "\"e1\""}})
        );
    }

    #[tokio::test]
    async fn test_failed_upload_deletes_orphaned_record() {
        let transport = upload_transport(true);
        let client = signed_in(transport.clone());
        let data = Bytes::from_static(b"0123456789");
        let reference = pending_reference(&data);

        let mut record = Record::new(CollectionType::Media, None);
        record.attach_asset(reference.clone(), "content");
        let blobs = HashMap::from([(reference.fingerprint.clone(), data)]);

        let err = client
            .create_record_with_assets(&mut record, &blobs, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UploadFailed(_)));
        assert_eq!(*record.state(), SyncState::Expunged);
        assert_eq!(transport.count(EXPUNGE_PATH), 1);
        assert_eq!(transport.count("/assets/complete"), 0);
    }

    #[tokio::test]
    async fn test_thumbnail_upload_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let transport = MockTransport::new(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(HttpResponse::new(if n < 2 { 503 } else { 200 }, ""))
        })
        .shared();
        let client = signed_in(transport);
        let url = Url::parse("https://s3.example.com/thumb").unwrap();

        client
            .upload_thumbnail(&url, Bytes::from_static(b"png"), "image/png")
            .await
            .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_thumbnail_upload_gives_up() {
        let transport = MockTransport::new(|_| Ok(HttpResponse::new(500, ""))).shared();
        let client = signed_in(transport.clone());
        let url = Url::parse("https://s3.example.com/thumb").unwrap();

        let err = client
            .upload_thumbnail(&url, Bytes::from_static(b"png"), "image/png")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UploadFailed(_)));
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_presigned_url_failure_status() {
        let transport = MockTransport::new(|_| Ok(HttpResponse::new(404, ""))).shared();
        let client = signed_in(transport);
        let err = client.presigned_url_for("/assets/download").await.unwrap_err();
        assert_eq!(err, SyncError::Asset(AssetError::RefreshFailed { status: 404 }));
    }

    #[tokio::test]
    async fn test_resolve_download_urls_prefers_thumbnail() {
        let transport = MockTransport::new(|req| {
            assert_eq!(req.url.path(), "/assets/thumb");
            Ok(HttpResponse::new(200, "https://cdn.example.com/t?Expires=4102444800"))
        })
        .shared();
        let client = signed_in(transport.clone());

        let thumb = AssetReference::pending(fingerprint_for(b"thumb", "image/jpeg"))
            .with_download_url("/assets/thumb")
            .uploaded();
        let content = AssetReference::pending(fingerprint_for(b"content", "image/png"))
            .with_download_url("/assets/content")
            .uploaded();
        let mut record = Record::new(CollectionType::Page, None);
        record.attach_asset(thumb.clone(), "thumbnail");
        record.attach_asset(content, "content");

        let mut records = vec![record];
        assert_eq!(client.resolve_download_urls(&mut records).await, 1);
        assert_eq!(transport.requests().len(), 1);
        let refreshed = records[0].asset_reference("thumbnail", true).unwrap();
        assert!(!refreshed.has_expired());
    }

    #[tokio::test]
    async fn test_remote_asset_refreshes_through_client() {
        let transport = MockTransport::new(|req| match req.url.path() {
            "/assets/download" => Ok(HttpResponse::new(
                200,
                "https://cdn.example.com/blob?Expires=4102444800",
            )),
            "/blob" => Ok(HttpResponse::new(200, "content")),
            other => panic!("unexpected path {}", other),
        })
        .shared();
        let client = signed_in(transport);
        let reference = AssetReference::pending(fingerprint_for(b"content", "a.txt"))
            .with_download_url("/assets/download")
            .uploaded();

        let asset = client.remote_asset(&reference, Some("r1".into()));
        let bytes = asset.open_as_blob().await.unwrap();
        assert_eq!(&bytes[..], b"content");
        assert_eq!(asset.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_batch_post() {
        let transport = MockTransport::new(|req| Ok(echo_batch(req)))
            .with_delay(std::time::Duration::from_secs(10))
            .shared();
        let client = signed_in(transport);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut records = dirty_records(1);
        let err = client.sync_records(&mut records, Some(&cancel)).await.unwrap_err();
        assert_eq!(err, SyncError::Cancelled);
        assert!(matches!(records[0].state(), SyncState::Failed { .. }));
    }
}
