//! Records: versioned property bags synced with the remote store.
//!
//! This module provides:
//! - `Record` with per-property last-writer-wins timestamps and dirty tracking
//! - `RecordWire`, the JSON body exchanged with the server
//! - `CollectionType` and `SyncState`
//!
//! Properties are only ever changed through [`Record::set_property`] so that
//! timestamps and the dirty set stay correct.

pub mod property;
pub mod sort_key;

pub use property::{DecodeProperty, PropertyEntry, PropertyKey, PropertyValue};
pub use sort_key::{SortKey, SortKeyError, SortKeyResult};

use crate::asset::{AssetReference, Fingerprint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

/// Server-side caches that never go back up and never affect equality
const TRANSIENT_FIELDS: &[&str] = &["collectionSortKey", "collectionStatusSortKey", "deletionBucket"];

/// Errors that can occur while decoding records
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid record payload: {0}")]
    InvalidPayload(String),
}

/// Result type for record operations
pub type RecordResult<T> = Result<T, RecordError>;

/// Collection a record belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CollectionType {
    Room,
    PagePresentation,
    Page,
    Media,
    Bridge,
    Presenter,
    LegacySlide,
    LegacyPresentation,
    Scene,
    Other(String),
}

impl CollectionType {
    pub fn as_str(&self) -> &str {
        match self {
            CollectionType::Room => "room",
            CollectionType::PagePresentation => "pagePresentation",
            CollectionType::Page => "page",
            CollectionType::Media => "media",
            CollectionType::Bridge => "bridge",
            CollectionType::Presenter => "presenter",
            CollectionType::LegacySlide => "slide",
            CollectionType::LegacyPresentation => "presentation",
            CollectionType::Scene => "scene",
            CollectionType::Other(name) => name,
        }
    }

    /// Legacy collections store arrays and objects as JSON text
    pub fn is_legacy(&self) -> bool {
        matches!(
            self,
            CollectionType::LegacySlide
                | CollectionType::LegacyPresentation
                | CollectionType::Scene
                | CollectionType::Room
        )
    }
}

impl From<&str> for CollectionType {
    fn from(name: &str) -> Self {
        match name {
            "room" => CollectionType::Room,
            "pagePresentation" => CollectionType::PagePresentation,
            "page" => CollectionType::Page,
            "media" => CollectionType::Media,
            "bridge" => CollectionType::Bridge,
            "presenter" => CollectionType::Presenter,
            "slide" => CollectionType::LegacySlide,
            "presentation" => CollectionType::LegacyPresentation,
            "scene" => CollectionType::Scene,
            other => CollectionType::Other(other.to_string()),
        }
    }
}

impl From<String> for CollectionType {
    fn from(name: String) -> Self {
        CollectionType::from(name.as_str())
    }
}

impl From<CollectionType> for String {
    fn from(collection: CollectionType) -> Self {
        collection.as_str().to_string()
    }
}

impl fmt::Display for CollectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a record is in its sync lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    /// Created locally, never posted
    LocalOnly,
    /// Synced once, mutated since
    Dirty,
    Posting,
    Synced,
    Failed { reason: String },
    /// Soft-deleted on the server
    Trashed,
    /// Permanently removed; terminal
    Expunged,
}

/// Record body as exchanged with the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordWire {
    pub id: String,
    pub collection: CollectionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub properties: BTreeMap<PropertyKey, PropertyEntry>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub asset_references: Vec<AssetReference>,
    /// Top-level fields the sync core does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A versioned property bag representing one document entity
#[derive(Debug, Clone)]
pub struct Record {
    id: String,
    collection: CollectionType,
    parent_id: Option<String>,
    version: i64,
    deleted: bool,
    properties: BTreeMap<PropertyKey, PropertyEntry>,
    asset_references: Vec<AssetReference>,
    extra: Map<String, Value>,
    /// Timestamp shared by every write in the current outgoing batch
    batch_timestamp: Option<DateTime<Utc>>,
    /// Latest timestamp seen on this instance, keeps stamps monotonic
    last_stamp: Option<DateTime<Utc>>,
    dirty: BTreeSet<PropertyKey>,
    state: SyncState,
}

impl Record {
    /// Create a new local record with a fresh id
    pub fn new(collection: CollectionType, parent_id: Option<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), collection, parent_id)
    }

    pub fn with_id(
        id: impl Into<String>,
        collection: CollectionType,
        parent_id: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            collection,
            parent_id,
            version: 0,
            deleted: false,
            properties: BTreeMap::new(),
            asset_references: Vec::new(),
            extra: Map::new(),
            batch_timestamp: None,
            last_stamp: None,
            dirty: BTreeSet::new(),
            state: SyncState::LocalOnly,
        }
    }

    /// Hydrate a record received from the server
    pub fn from_wire(wire: RecordWire) -> Self {
        let last_stamp = wire
            .properties
            .values()
            .map(|entry| entry.client_updated_time)
            .max();
        let state = if wire.deleted {
            SyncState::Trashed
        } else {
            SyncState::Synced
        };

        let mut record = Self {
            id: wire.id,
            collection: wire.collection,
            parent_id: wire.parent_id,
            version: wire.version,
            deleted: wire.deleted,
            properties: wire.properties,
            asset_references: wire.asset_references,
            extra: wire.extra,
            batch_timestamp: None,
            last_stamp,
            dirty: BTreeSet::new(),
            state,
        };
        if record.is_trashed() {
            record.state = SyncState::Trashed;
        }
        record
    }

    pub fn from_json(value: Value) -> RecordResult<Self> {
        let wire: RecordWire = serde_json::from_value(value)?;
        if wire.id.is_empty() {
            return Err(RecordError::InvalidPayload("record without id".to_string()));
        }
        Ok(Self::from_wire(wire))
    }

    /// Body to send to the server: server-side caches and `serverUpdatedTime` are stripped
    pub fn to_wire(&self) -> RecordWire {
        let mut wire = self.to_cache_wire();
        for key in TRANSIENT_FIELDS {
            wire.extra.remove(*key);
        }
        for entry in wire.properties.values_mut() {
            entry.server_updated_time = None;
        }
        wire
    }

    /// Full representation, including server bookkeeping, for the local cache
    pub fn to_cache_wire(&self) -> RecordWire {
        RecordWire {
            id: self.id.clone(),
            collection: self.collection.clone(),
            parent_id: self.parent_id.clone(),
            version: self.version,
            deleted: self.deleted,
            properties: self.properties.clone(),
            asset_references: self.asset_references.clone(),
            extra: self.extra.clone(),
        }
    }

    pub fn to_json(&self) -> RecordResult<Value> {
        Ok(serde_json::to_value(self.to_wire())?)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn collection(&self) -> &CollectionType {
        &self.collection
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn asset_references(&self) -> &[AssetReference] {
        &self.asset_references
    }

    pub fn properties(&self) -> impl Iterator<Item = (&PropertyKey, &PropertyEntry)> {
        self.properties.iter()
    }

    pub fn property_entry(&self, key: &PropertyKey) -> Option<&PropertyEntry> {
        self.properties.get(key)
    }

    pub fn has_property(&self, key: &PropertyKey) -> bool {
        self.properties.contains_key(key)
    }

    /// Soft-deleted, either by the `trashed` property or the server's `deleted` flag
    pub fn is_trashed(&self) -> bool {
        self.deleted || self.get_property_or(&PropertyKey::Trashed, false)
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn dirty_keys(&self) -> impl Iterator<Item = &PropertyKey> {
        self.dirty.iter()
    }

    /// Flag an existing property for the next post without restamping it
    pub fn mark_dirty(&mut self, key: PropertyKey) -> bool {
        if self.state == SyncState::Expunged || !self.properties.contains_key(&key) {
            return false;
        }
        self.dirty.insert(key);
        if matches!(self.state, SyncState::Synced | SyncState::Failed { .. }) {
            self.state = SyncState::Dirty;
        }
        true
    }

    /// Set a property through the encode path, stamping it if the value changed.
    ///
    /// Returns whether anything was written.
    pub fn set_property(&mut self, key: impl Into<PropertyKey>, value: impl Into<PropertyValue>) -> bool {
        self.set_property_at(key, value, Utc::now())
    }

    /// [`Record::set_property`] with an explicit clock reading
    pub fn set_property_at(
        &mut self,
        key: impl Into<PropertyKey>,
        value: impl Into<PropertyValue>,
        now: DateTime<Utc>,
    ) -> bool {
        self.encode_property(key.into(), value.into(), false, now)
    }

    fn encode_property(
        &mut self,
        key: PropertyKey,
        value: PropertyValue,
        force: bool,
        now: DateTime<Utc>,
    ) -> bool {
        if self.state == SyncState::Expunged {
            debug!(record_id = %self.id, %key, "Ignoring write to expunged record");
            return false;
        }
        let legacy = self.collection.is_legacy();
        let encoded = value.encode(legacy);

        let existing = self.properties.get(&key);
        if !force && existing.is_none() && encoded.is_none() {
            // Neither side knows a value; nothing to reconcile
            return false;
        }
        if let Some(entry) = existing {
            if values_match(entry.value(), encoded.as_ref(), legacy) {
                return false;
            }
        }

        let stamp = self.batch_stamp(now);
        let value = match (force, encoded) {
            (_, Some(value)) => Some(value),
            (true, None) => Some(Value::Null),
            (false, None) => None,
        };
        self.properties
            .insert(key.clone(), PropertyEntry::new(value, stamp));
        self.dirty.insert(key);
        if matches!(self.state, SyncState::Synced | SyncState::Failed { .. }) {
            self.state = SyncState::Dirty;
        }
        true
    }

    /// The timestamp for the current outgoing batch, established lazily
    fn batch_stamp(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(stamp) = self.batch_timestamp {
            return stamp;
        }
        let mut stamp = property::truncate_to_second(now);
        if let Some(last) = self.last_stamp {
            stamp = stamp.max(last);
        }
        self.batch_timestamp = Some(stamp);
        self.last_stamp = Some(stamp);
        stamp
    }

    /// Typed read; `None` if absent, null or of another shape
    pub fn get_property<T: DecodeProperty>(&self, key: &PropertyKey) -> Option<T> {
        let value = self.properties.get(key)?.value()?;
        T::decode(value, self.collection.is_legacy())
    }

    pub fn get_property_or<T: DecodeProperty>(&self, key: &PropertyKey, default: T) -> T {
        self.get_property(key).unwrap_or(default)
    }

    pub fn sort_key(&self) -> Option<SortKey> {
        self.get_property(&PropertyKey::SortIndex)
    }

    /// Attach a content-addressed blob to a named slot such as `content` or `thumbnail`
    pub fn attach_asset(&mut self, reference: AssetReference, slot: &str) -> bool {
        let fingerprint = reference.fingerprint.clone();
        if !self
            .asset_references
            .iter()
            .any(|existing| existing.fingerprint == fingerprint)
        {
            self.asset_references.push(reference);
        }
        self.set_property(PropertyKey::asset(slot), fingerprint.to_string())
    }

    /// Clear a slot by writing an explicit null
    pub fn detach_asset(&mut self, slot: &str) -> bool {
        self.encode_property(PropertyKey::asset(slot), PropertyValue::null(), true, Utc::now())
    }

    pub fn asset_fingerprint(&self, slot: &str) -> Option<Fingerprint> {
        let raw: String = self.get_property(&PropertyKey::asset(slot))?;
        Fingerprint::parse(&raw).ok()
    }

    /// Reference attached to a slot; with `require_uploaded`, pending uploads are skipped
    pub fn asset_reference(&self, slot: &str, require_uploaded: bool) -> Option<&AssetReference> {
        let fingerprint = self.asset_fingerprint(slot)?;
        let reference = self
            .asset_references
            .iter()
            .find(|r| r.fingerprint == fingerprint)?;
        if require_uploaded && !reference.uploaded {
            warn!(record_id = %self.id, slot, "Found matching asset, but uploaded is false");
            return None;
        }
        Some(reference)
    }

    /// Like [`Record::asset_reference`] with `require_uploaded`, but a reference
    /// missing from a record whose slot names a fingerprint is rebuilt against
    /// the user's asset endpoint.
    pub fn resolve_asset_reference(
        &mut self,
        slot: &str,
        base_url: &Url,
        user_id: &str,
    ) -> Option<AssetReference> {
        let fingerprint = self.asset_fingerprint(slot)?;
        if !self.asset_references.iter().any(|r| r.fingerprint == fingerprint) {
            let path = format!("/users/{}/sync/assets/{}", user_id, fingerprint);
            let download_url = base_url.join(&path).ok()?;
            debug!(record_id = %self.id, %fingerprint, "Synthesizing missing asset reference");
            self.asset_references.push(
                AssetReference::pending(fingerprint)
                    .with_download_url(download_url.to_string())
                    .uploaded(),
            );
        }
        self.asset_reference(slot, true).cloned()
    }

    /// Replace the reference carrying the same fingerprint
    pub fn update_asset_reference(&mut self, reference: AssetReference) {
        match self
            .asset_references
            .iter_mut()
            .find(|r| r.fingerprint == reference.fingerprint)
        {
            Some(existing) => *existing = reference,
            None => self.asset_references.push(reference),
        }
    }

    /// Merge a server copy, last writer wins per property (ties go to the server).
    ///
    /// Returns whether anything changed locally.
    pub fn merge_from(&mut self, server: &Record) -> bool {
        let mut changed = false;

        for (key, theirs) in &server.properties {
            match self.properties.get(key) {
                Some(ours) if ours.client_updated_time > theirs.client_updated_time => {}
                Some(ours) if ours == theirs => {
                    self.dirty.remove(key);
                }
                _ => {
                    self.properties.insert(key.clone(), theirs.clone());
                    self.dirty.remove(key);
                    changed = true;
                }
            }
        }

        let dirty = &self.dirty;
        let before = self.properties.len();
        self.properties
            .retain(|key, _| server.properties.contains_key(key) || dirty.contains(key));
        changed |= self.properties.len() != before;

        for reference in &server.asset_references {
            if !self.asset_references.contains(reference) {
                self.update_asset_reference(reference.clone());
                changed = true;
            }
        }

        if self.version != server.version || self.deleted != server.deleted {
            changed = true;
        }
        self.version = server.version;
        self.deleted = server.deleted;
        self.extra = server.extra.clone();
        self.last_stamp = self.last_stamp.max(server.last_stamp);
        // An open batch must not stamp later writes below what was just merged
        if self.batch_timestamp.is_some() && self.batch_timestamp < self.last_stamp {
            self.batch_timestamp = None;
        }
        changed
    }

    /// Deep copy under a fresh id with every property re-stamped as a new local write
    pub fn duplicate(&self) -> Record {
        let stamp = property::truncate_to_second(Utc::now());
        let mut copy = Record::new(self.collection.clone(), self.parent_id.clone());
        copy.properties = self
            .properties
            .iter()
            .map(|(key, entry)| (key.clone(), PropertyEntry::new(entry.value.clone(), stamp)))
            .collect();
        copy.dirty = copy.properties.keys().cloned().collect();
        copy.asset_references = self.asset_references.clone();
        copy.batch_timestamp = Some(stamp);
        copy.last_stamp = Some(stamp);
        copy
    }

    /// Enter `Posting` and return the body to send
    pub fn begin_post(&mut self) -> RecordWire {
        self.state = SyncState::Posting;
        self.to_wire()
    }

    /// Complete a successful post, merging the server's copy if one was returned
    pub fn finish_post(&mut self, server: Option<&Record>) {
        self.dirty.clear();
        if let Some(server) = server {
            self.merge_from(server);
        }
        self.batch_timestamp = None;
        self.state = if self.is_trashed() {
            SyncState::Trashed
        } else {
            SyncState::Synced
        };
    }

    /// Record a failed post; dirty properties are kept for the next attempt
    pub fn fail_post(&mut self, reason: impl Into<String>) {
        self.batch_timestamp = None;
        self.state = SyncState::Failed {
            reason: reason.into(),
        };
    }

    pub fn mark_expunged(&mut self) {
        self.deleted = true;
        self.dirty.clear();
        self.state = SyncState::Expunged;
    }
}

fn values_match(existing: Option<&Value>, encoded: Option<&Value>, legacy: bool) -> bool {
    match (existing, encoded) {
        (None, None) => true,
        (Some(a), Some(b)) if legacy => legacy_text(a) == legacy_text(b),
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn legacy_text(value: &Value) -> std::borrow::Cow<'_, str> {
    match value {
        Value::String(s) => std::borrow::Cow::Borrowed(s),
        other => std::borrow::Cow::Owned(other.to_string()),
    }
}

impl PartialEq for Record {
    /// Equality over values, ignoring timestamps, dirty tracking, server caches
    /// and `__`-prefixed private fields
    fn eq(&self, other: &Self) -> bool {
        let values = |record: &Record| -> Vec<(PropertyKey, Option<Value>)> {
            record
                .properties
                .iter()
                .map(|(key, entry)| (key.clone(), entry.value.clone()))
                .collect()
        };
        let extras = |record: &Record| -> Map<String, Value> {
            let mut extra = record.extra.clone();
            for key in TRANSIENT_FIELDS {
                extra.remove(*key);
            }
            extra.retain(|key, _| !key.starts_with("__"));
            extra
        };

        self.id == other.id
            && self.collection == other.collection
            && self.parent_id == other.parent_id
            && self.version == other.version
            && self.deleted == other.deleted
            && self.asset_references == other.asset_references
            && values(self) == values(other)
            && extras(self) == extras(other)
    }
}
