//! Storage module for the local record cache using Sled.
//!
//! This module keeps server records, content-addressed blobs and the queue of
//! records waiting to be posted in an embedded database so they survive
//! restarts. Records are stored as their cache wire JSON; bookkeeping entries
//! are bincode-encoded.

mod sled_store;

pub use sled_store::{ApplyStats, RecordStore, StorageError, StorageResult, StorageStats};

use serde::{Deserialize, Serialize};

/// Metadata stored alongside each cached blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    /// Fingerprint string the blob is keyed by
    pub fingerprint: String,
    /// Size of the blob in bytes
    pub size_bytes: u64,
    /// Unix timestamp of when the blob was stored
    pub stored_at: i64,
}

impl BlobMetadata {
    pub fn new(fingerprint: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            size_bytes,
            stored_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// A record waiting to be posted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEntry {
    /// Cache wire JSON of the record
    pub record: Vec<u8>,
    /// Property names that still need to be sent
    pub dirty: Vec<String>,
    /// Unix timestamp of when the record was queued
    pub queued_at: i64,
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 64MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = only explicit flushes)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/deck-sync.sled".to_string(),
            cache_size: 64 * 1024 * 1024, // 64MB
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Default configuration with the path taken from `DECK_SYNC_CACHE_PATH` if set
    pub fn from_env() -> Self {
        match std::env::var("DECK_SYNC_CACHE_PATH") {
            Ok(path) if !path.is_empty() => Self::new(path),
            _ => Self::default(),
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_flush_interval(mut self, interval_ms: u64) -> Self {
        self.flush_interval_ms = interval_ms;
        self
    }
}
