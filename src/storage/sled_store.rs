//! Sled-based record store.
//!
//! This module provides persistent local state for the sync client using the
//! Sled embedded database. It supports:
//! - A cache of server records keyed by collection and id
//! - Content-addressed blobs keyed by fingerprint
//! - A queue of dirty records that survives restarts

use bytes::Bytes;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BlobMetadata, PendingEntry, StorageConfig};
use crate::asset::{fingerprint_for, Fingerprint, UrlRefreshed};
use crate::record::{CollectionType, PropertyKey, Record, RecordWire};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Record encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Tree names for different data types
const TREE_RECORDS: &str = "records";
const TREE_INDEX: &str = "record_index";
const TREE_BLOBS: &str = "blobs";
const TREE_BLOB_METADATA: &str = "blob_metadata";
const TREE_PENDING: &str = "pending";

/// Outcome of applying a set of server records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub stored: usize,
    pub unchanged: usize,
    pub removed: usize,
}

/// Sled-backed local cache of records and blobs
#[derive(Clone)]
pub struct RecordStore {
    db: Arc<Db>,
    records: Tree,
    index: Tree,
    blobs: Tree,
    blob_metadata: Tree,
    pending: Tree,
}

fn record_key(collection: &CollectionType, id: &str) -> String {
    format!("{}/{}", collection, id)
}

impl RecordStore {
    /// Open or create a store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let records = db.open_tree(TREE_RECORDS)?;
        let index = db.open_tree(TREE_INDEX)?;
        let blobs = db.open_tree(TREE_BLOBS)?;
        let blob_metadata = db.open_tree(TREE_BLOB_METADATA)?;
        let pending = db.open_tree(TREE_PENDING)?;

        info!(path = %config.path, records = records.len(), "Opened record store");
        Ok(Self {
            db: Arc::new(db),
            records,
            index,
            blobs,
            blob_metadata,
            pending,
        })
    }

    /// Fold a page of server records into the cache.
    ///
    /// Deleted and trashed records are removed; records identical to the
    /// cached copy are left alone.
    pub fn apply_server_records(&self, records: &[Record]) -> StorageResult<ApplyStats> {
        let mut stats = ApplyStats::default();
        for record in records {
            if record.is_trashed() {
                if self.remove_record(record.id())? {
                    stats.removed += 1;
                }
                continue;
            }

            let key = record_key(record.collection(), record.id());
            let bytes = serde_json::to_vec(&record.to_cache_wire())?;
            if let Some(existing) = self.records.get(key.as_bytes())? {
                if existing.as_ref() == bytes.as_slice() {
                    stats.unchanged += 1;
                    continue;
                }
            }
            self.records.insert(key.as_bytes(), bytes)?;
            self.index
                .insert(record.id().as_bytes(), record.collection().as_str().as_bytes())?;
            stats.stored += 1;
        }
        debug!(
            stored = stats.stored,
            unchanged = stats.unchanged,
            removed = stats.removed,
            "Applied server records"
        );
        Ok(stats)
    }

    /// Store one record regardless of its trashed state
    pub fn save_record(&self, record: &Record) -> StorageResult<()> {
        let key = record_key(record.collection(), record.id());
        self.records
            .insert(key.as_bytes(), serde_json::to_vec(&record.to_cache_wire())?)?;
        self.index
            .insert(record.id().as_bytes(), record.collection().as_str().as_bytes())?;
        Ok(())
    }

    /// Look up a cached record by id
    pub fn record(&self, id: &str) -> StorageResult<Option<Record>> {
        let Some(collection) = self.index.get(id.as_bytes())? else {
            return Ok(None);
        };
        let collection = CollectionType::from(String::from_utf8_lossy(&collection).into_owned());
        match self.records.get(record_key(&collection, id).as_bytes())? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Err(StorageError::Corruption(format!(
                "Index entry for {} has no record",
                id
            ))),
        }
    }

    /// Cached records of one collection, ordered by sort key then id
    pub fn records_in(&self, collection: &CollectionType) -> StorageResult<Vec<Record>> {
        let prefix = format!("{}/", collection);
        let mut records = Vec::new();
        for item in self.records.scan_prefix(prefix.as_bytes()) {
            let (_, value) = item?;
            records.push(decode_record(&value)?);
        }
        records.sort_by(|a, b| {
            a.sort_key()
                .cmp(&b.sort_key())
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(records)
    }

    /// Remove a record; returns whether it was cached
    pub fn remove_record(&self, id: &str) -> StorageResult<bool> {
        let Some(collection) = self.index.remove(id.as_bytes())? else {
            return Ok(false);
        };
        let collection = CollectionType::from(String::from_utf8_lossy(&collection).into_owned());
        self.records.remove(record_key(&collection, id).as_bytes())?;
        Ok(true)
    }

    /// Record a new presigned URL on the cached parent record
    pub fn update_presigned_url(
        &self,
        parent_id: &str,
        fingerprint: &Fingerprint,
        url: &str,
    ) -> StorageResult<bool> {
        let Some(mut record) = self.record(parent_id)? else {
            return Ok(false);
        };
        let Some(reference) = record
            .asset_references()
            .iter()
            .find(|r| &r.fingerprint == fingerprint)
            .cloned()
        else {
            return Ok(false);
        };
        if reference.presigned_download_url.as_deref() == Some(url) {
            return Ok(false);
        }
        record.update_asset_reference(reference.with_presigned_url(url));
        self.save_record(&record)?;
        debug!(record_id = %parent_id, %fingerprint, "Updated cached presigned URL");
        Ok(true)
    }

    /// Keep cached presigned URLs in step with an asset's refresh events
    pub fn follow_url_refreshes(
        &self,
        mut events: broadcast::Receiver<UrlRefreshed>,
    ) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(parent_id) = event.parent_id.as_deref() else {
                            continue;
                        };
                        if let Err(e) = store.update_presigned_url(
                            parent_id,
                            &event.fingerprint,
                            event.current.as_str(),
                        ) {
                            warn!(record_id = %parent_id, "Failed to store refreshed URL: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed presigned URL refresh events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Store content under its fingerprint; returns false if it was already present
    pub fn put_blob(&self, fingerprint: &Fingerprint, data: &[u8]) -> StorageResult<bool> {
        if let Some(expected) = fingerprint.byte_length() {
            if expected != data.len() as u64 {
                return Err(StorageError::Corruption(format!(
                    "Blob for {} has {} bytes",
                    fingerprint,
                    data.len()
                )));
            }
        }
        let key = fingerprint.as_str().as_bytes();
        if self.blobs.contains_key(key)? {
            return Ok(false);
        }
        self.blobs.insert(key, data)?;
        let meta = BlobMetadata::new(fingerprint.as_str(), data.len() as u64);
        self.blob_metadata.insert(key, bincode::serialize(&meta)?)?;
        Ok(true)
    }

    /// Fingerprint and store content in one step
    pub fn put_content(&self, data: &[u8], name_or_mime_hint: &str) -> StorageResult<Fingerprint> {
        let fingerprint = fingerprint_for(data, name_or_mime_hint);
        self.put_blob(&fingerprint, data)?;
        Ok(fingerprint)
    }

    pub fn blob(&self, fingerprint: &Fingerprint) -> StorageResult<Option<Bytes>> {
        Ok(self
            .blobs
            .get(fingerprint.as_str().as_bytes())?
            .map(|data| Bytes::copy_from_slice(&data)))
    }

    pub fn blob_metadata(&self, fingerprint: &Fingerprint) -> StorageResult<Option<BlobMetadata>> {
        match self.blob_metadata.get(fingerprint.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Queue a dirty record for posting, replacing any earlier entry for it
    pub fn queue_pending(&self, record: &Record) -> StorageResult<()> {
        let entry = PendingEntry {
            record: serde_json::to_vec(&record.to_cache_wire())?,
            dirty: record.dirty_keys().map(|key| key.to_string()).collect(),
            queued_at: chrono::Utc::now().timestamp(),
        };
        self.pending
            .insert(record.id().as_bytes(), bincode::serialize(&entry)?)?;
        Ok(())
    }

    /// Queued records with their dirty properties restored
    pub fn pending(&self) -> StorageResult<Vec<Record>> {
        let mut entries = Vec::new();
        for item in self.pending.iter() {
            let (_, value) = item?;
            entries.push(bincode::deserialize::<PendingEntry>(&value)?);
        }
        entries.sort_by_key(|entry| entry.queued_at);

        entries
            .into_iter()
            .map(|entry| {
                let mut record = decode_record(&entry.record)?;
                for key in entry.dirty {
                    record.mark_dirty(PropertyKey::from(key));
                }
                Ok(record)
            })
            .collect()
    }

    pub fn clear_pending(&self, id: &str) -> StorageResult<bool> {
        Ok(self.pending.remove(id.as_bytes())?.is_some())
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        let blob_bytes = self
            .blob_metadata
            .iter()
            .filter_map(Result::ok)
            .filter_map(|(_, value)| bincode::deserialize::<BlobMetadata>(&value).ok())
            .map(|meta| meta.size_bytes)
            .sum();
        StorageStats {
            record_count: self.records.len(),
            blob_count: self.blobs.len(),
            blob_bytes,
            pending_count: self.pending.len(),
            total_size_bytes: self.db.size_on_disk().unwrap_or(0),
        }
    }
}

fn decode_record(bytes: &[u8]) -> StorageResult<Record> {
    let wire: RecordWire = serde_json::from_slice(bytes)?;
    Ok(Record::from_wire(wire))
}

/// Statistics about the storage
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub record_count: usize,
    pub blob_count: usize,
    pub blob_bytes: u64,
    pub pending_count: usize,
    pub total_size_bytes: u64,
}

impl Drop for RecordStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetReference;
    use crate::record::{SortKey, SyncState};
    use tempfile::{tempdir, TempDir};
    use tokio_test::{assert_err, assert_ok};
    use url::Url;

    fn test_store() -> (TempDir, RecordStore) {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("test.sled").to_string_lossy().to_string())
            .with_flush_interval(0);
        let store = RecordStore::open(config).unwrap();
        (dir, store)
    }

    fn server_record(id: &str, title: &str) -> Record {
        let mut record = Record::with_id(id, CollectionType::Page, Some("deck-1".into()));
        record.set_property(PropertyKey::Title, title);
        record.finish_post(None);
        record
    }

    #[test]
    fn test_apply_server_records() {
        let (_dir, store) = test_store();
        let records = vec![server_record("a", "one"), server_record("b", "two")];

        let stats = store.apply_server_records(&records).unwrap();
        assert_eq!(stats, ApplyStats { stored: 2, unchanged: 0, removed: 0 });

        let stats = store.apply_server_records(&records).unwrap();
        assert_eq!(stats.unchanged, 2);

        let loaded = store.record("a").unwrap().unwrap();
        assert_eq!(loaded, records[0]);
        assert_eq!(loaded.get_property::<String>(&PropertyKey::Title).as_deref(), Some("one"));
    }

    #[test]
    fn test_trashed_records_are_removed() {
        let (_dir, store) = test_store();
        let mut record = server_record("a", "one");
        store.apply_server_records(&[record.clone()]).unwrap();

        record.set_property(PropertyKey::Trashed, true);
        let stats = store.apply_server_records(&[record]).unwrap();
        assert_eq!(stats.removed, 1);
        assert!(store.record("a").unwrap().is_none());
        assert!(store.records_in(&CollectionType::Page).unwrap().is_empty());
    }

    #[test]
    fn test_records_in_sorted_by_sort_key() {
        let (_dir, store) = test_store();
        let mut first = server_record("z", "first");
        first.set_property(PropertyKey::SortIndex, SortKey::from(10u64).to_string());
        let mut second = server_record("a", "second");
        second.set_property(PropertyKey::SortIndex, SortKey::from(20u64).to_string());
        let other = Record::with_id("m", CollectionType::Media, None);

        store.apply_server_records(&[second, first, other]).unwrap();
        let ids: Vec<String> = store
            .records_in(&CollectionType::Page)
            .unwrap()
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        assert_eq!(ids, vec!["z", "a"]);
    }

    #[test]
    fn test_blobs_are_deduplicated() {
        let (_dir, store) = test_store();
        let fingerprint = assert_ok!(store.put_content(b"png bytes", "a.png"));
        assert!(!assert_ok!(store.put_blob(&fingerprint, b"png bytes")));

        assert_eq!(&store.blob(&fingerprint).unwrap().unwrap()[..], b"png bytes");
        assert_eq!(store.blob_metadata(&fingerprint).unwrap().unwrap().size_bytes, 9);
        let stats = store.stats();
        assert_eq!(stats.blob_count, 1);
        assert_eq!(stats.blob_bytes, 9);
    }

    #[test]
    fn test_blob_length_mismatch_is_rejected() {
        let (_dir, store) = test_store();
        let fingerprint = fingerprint_for(b"abc", "a.txt");
        let err = assert_err!(store.put_blob(&fingerprint, b"abcd"));
        assert!(matches!(err, StorageError::Corruption(_)));
    }

    #[test]
    fn test_pending_queue_restores_dirty_state() {
        let (_dir, store) = test_store();
        let mut record = server_record("a", "one");
        record.set_property(PropertyKey::Name, "renamed");
        store.queue_pending(&record).unwrap();

        let pending = store.pending().unwrap();
        assert_eq!(pending.len(), 1);
        let restored = &pending[0];
        assert_eq!(*restored.state(), SyncState::Dirty);
        assert_eq!(restored.dirty_keys().collect::<Vec<_>>(), vec![&PropertyKey::Name]);

        assert!(store.clear_pending("a").unwrap());
        assert!(store.pending().unwrap().is_empty());
        assert!(!store.clear_pending("a").unwrap());
    }

    #[test]
    fn test_update_presigned_url() {
        let (_dir, store) = test_store();
        let reference = AssetReference::pending(fingerprint_for(b"img", "image/png"))
            .with_download_url("/assets/1")
            .uploaded();
        let mut record = server_record("a", "one");
        record.attach_asset(reference.clone(), "content");
        store.save_record(&record).unwrap();

        let url = "https://cdn.example.com/img?Expires=4102444800";
        assert!(store
            .update_presigned_url("a", &reference.fingerprint, url)
            .unwrap());
        assert!(!store
            .update_presigned_url("a", &reference.fingerprint, url)
            .unwrap());
        assert!(!store
            .update_presigned_url("missing", &reference.fingerprint, url)
            .unwrap());

        let cached = store.record("a").unwrap().unwrap();
        assert_eq!(
            cached.asset_references()[0].presigned_download_url.as_deref(),
            Some(url)
        );
    }

    #[tokio::test]
    async fn test_follow_url_refreshes() {
        let (_dir, store) = test_store();
        let reference = AssetReference::pending(fingerprint_for(b"img", "image/png")).uploaded();
        let mut record = server_record("a", "one");
        record.attach_asset(reference.clone(), "content");
        store.save_record(&record).unwrap();

        let (tx, rx) = broadcast::channel(4);
        let task = store.follow_url_refreshes(rx);
        let current = Url::parse("https://cdn.example.com/img?Expires=4102444800").unwrap();
        tx.send(UrlRefreshed {
            fingerprint: reference.fingerprint.clone(),
            parent_id: Some("a".into()),
            previous: None,
            current: current.clone(),
        })
        .unwrap();
        drop(tx);
        task.await.unwrap();

        let cached = store.record("a").unwrap().unwrap();
        assert_eq!(
            cached.asset_references()[0].presigned_download_url.as_deref(),
            Some(current.as_str())
        );
    }

    #[test]
    fn test_reopen_keeps_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reopen.sled").to_string_lossy().to_string();
        {
            let store =
                RecordStore::open(StorageConfig::new(path.clone()).with_flush_interval(0)).unwrap();
            store.apply_server_records(&[server_record("a", "one")]).unwrap();
        }
        let store = RecordStore::open(StorageConfig::new(path).with_flush_interval(0)).unwrap();
        assert!(store.record("a").unwrap().is_some());
        assert_eq!(store.stats().record_count, 1);
    }
}
