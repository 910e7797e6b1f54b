//! deck-sync - client-side document synchronization core
//!
//! Keeps locally mutated records consistent with a remote store using:
//! - Per-property last-writer-wins timestamps
//! - Fractional sort keys for sibling ordering without renumbering
//! - Content-addressed assets with presigned URL refresh
//! - Batched, paginated and multi-part HTTP sync with single-flight token refresh
//! - A Sled-backed local cache

pub mod asset;
pub mod record;
pub mod single_flight;
pub mod storage;
pub mod sync;

pub use asset::{fingerprint_for, Asset, AssetReference, Fingerprint, LocalAsset, RemoteAsset};
pub use record::{CollectionType, PropertyKey, Record, SortKey, SyncState};
pub use storage::{RecordStore, StorageConfig};
pub use sync::{ClientConfig, EndpointRegistry, SyncClient, SyncError, SyncResult};
