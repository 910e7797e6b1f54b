//! Typed property identifiers, the encode path and typed decoding.
//!
//! Property names travel as plain strings on the wire. Internally they are
//! `PropertyKey`s: the names the sync core cares about are enumerated, anything
//! else is carried through as `PropertyKey::Other`.

use super::sort_key::SortKey;
use chrono::{DateTime, SecondsFormat, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use tracing::warn;

/// Suffix of the property that names an attached asset, e.g. `thumbnailAssetFingerprint`
pub const ASSET_FINGERPRINT_SUFFIX: &str = "AssetFingerprint";

/// Enumerated property identifiers
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PropertyKey {
    Name,
    Title,
    Type,
    /// Soft-delete marker
    Trashed,
    Hidden,
    Content,
    Metadata,
    SpeakerNotes,
    /// Position among siblings, a [`SortKey`]
    SortIndex,
    /// `{slot}AssetFingerprint`
    AssetFingerprint(String),
    Other(String),
}

impl PropertyKey {
    /// Fingerprint property for an asset slot such as `content` or `thumbnail`
    pub fn asset(slot: &str) -> Self {
        PropertyKey::AssetFingerprint(slot.to_string())
    }

    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        use std::borrow::Cow;
        match self {
            PropertyKey::Name => Cow::Borrowed("name"),
            PropertyKey::Title => Cow::Borrowed("title"),
            PropertyKey::Type => Cow::Borrowed("type"),
            PropertyKey::Trashed => Cow::Borrowed("trashed"),
            PropertyKey::Hidden => Cow::Borrowed("hidden"),
            PropertyKey::Content => Cow::Borrowed("content"),
            PropertyKey::Metadata => Cow::Borrowed("metadata"),
            PropertyKey::SpeakerNotes => Cow::Borrowed("speakerNotes"),
            PropertyKey::SortIndex => Cow::Borrowed("sortIndex"),
            PropertyKey::AssetFingerprint(slot) => {
                Cow::Owned(format!("{}{}", slot, ASSET_FINGERPRINT_SUFFIX))
            }
            PropertyKey::Other(name) => Cow::Borrowed(name.as_str()),
        }
    }
}

impl From<&str> for PropertyKey {
    fn from(name: &str) -> Self {
        match name {
            "name" => PropertyKey::Name,
            "title" => PropertyKey::Title,
            "type" => PropertyKey::Type,
            "trashed" => PropertyKey::Trashed,
            "hidden" => PropertyKey::Hidden,
            "content" => PropertyKey::Content,
            "metadata" => PropertyKey::Metadata,
            "speakerNotes" => PropertyKey::SpeakerNotes,
            "sortIndex" => PropertyKey::SortIndex,
            other => match other.strip_suffix(ASSET_FINGERPRINT_SUFFIX) {
                Some(slot) if !slot.is_empty() => PropertyKey::AssetFingerprint(slot.to_string()),
                _ => PropertyKey::Other(other.to_string()),
            },
        }
    }
}

impl From<String> for PropertyKey {
    fn from(name: String) -> Self {
        PropertyKey::from(name.as_str())
    }
}

impl From<PropertyKey> for String {
    fn from(key: PropertyKey) -> Self {
        key.as_str().into_owned()
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

/// One timestamped property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyEntry {
    /// `None` when the entry carries no value at all, `Some(Null)` for an explicit null
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub value: Option<Value>,
    #[serde(default = "epoch", with = "wire_time")]
    pub client_updated_time: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "wire_time::optional"
    )]
    pub server_updated_time: Option<DateTime<Utc>>,
}

impl PropertyEntry {
    pub fn new(value: Option<Value>, client_updated_time: DateTime<Utc>) -> Self {
        Self {
            value,
            client_updated_time,
            server_updated_time: None,
        }
    }

    /// The value, treating an explicit null like an absent one
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref().filter(|v| !v.is_null())
    }
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::from(std::time::UNIX_EPOCH)
}

/// Truncate to whole seconds; the remote store rejects sub-second timestamps
pub fn truncate_to_second(time: DateTime<Utc>) -> DateTime<Utc> {
    time.trunc_subsecs(0)
}

/// Format a timestamp as `2022-04-25T17:15:09Z`
pub fn format_wire_time(time: &DateTime<Utc>) -> String {
    truncate_to_second(*time).to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse an RFC 3339 timestamp, truncating any fractional seconds
pub fn parse_wire_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|time| truncate_to_second(time.with_timezone(&Utc)))
}

/// Serde adapter for wire timestamps; unreadable input decodes as the epoch
pub mod wire_time {
    use super::*;

    pub fn serialize<S: Serializer>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_wire_time(time))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(lenient).unwrap_or_else(epoch))
    }

    fn lenient(raw: &str) -> DateTime<Utc> {
        parse_wire_time(raw).unwrap_or_else(|| {
            warn!(value = %raw, "Unreadable property timestamp");
            epoch()
        })
    }

    pub mod optional {
        use super::*;

        pub fn serialize<S: Serializer>(
            time: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match time {
                Some(time) => serializer.serialize_str(&format_wire_time(time)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            Ok(raw.as_deref().and_then(parse_wire_time))
        }
    }
}

/// A value on its way into a record; `None` writes null
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PropertyValue(Option<Value>);

impl PropertyValue {
    pub fn null() -> Self {
        Self(None)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.0, None | Some(Value::Null))
    }

    /// Encoded JSON for storage; legacy collections store arrays and objects as JSON text
    pub(crate) fn encode(self, legacy: bool) -> Option<Value> {
        match self.0 {
            None | Some(Value::Null) => None,
            Some(value @ (Value::Array(_) | Value::Object(_))) if legacy => {
                Some(Value::String(value.to_string()))
            }
            Some(value) => Some(value),
        }
    }
}

impl From<Value> for PropertyValue {
    fn from(value: Value) -> Self {
        Self(Some(value))
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self(Some(Value::Bool(value)))
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self(Some(Value::String(value.to_string())))
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self(Some(Value::String(value)))
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self(Some(Value::from(value)))
    }
}

impl From<u64> for PropertyValue {
    fn from(value: u64) -> Self {
        Self(Some(Value::from(value)))
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        Self(Some(Value::from(value)))
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self(Some(Value::from(value)))
    }
}

impl From<SortKey> for PropertyValue {
    fn from(value: SortKey) -> Self {
        Self(Some(Value::String(value.to_string())))
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self(Some(Value::String(format_wire_time(&value))))
    }
}

impl<T: Into<PropertyValue>> From<Option<T>> for PropertyValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_default()
    }
}

/// Typed decoding of a stored property value.
///
/// Returns `None` when the stored shape does not match; callers fall back to a default.
pub trait DecodeProperty: Sized {
    fn decode(value: &Value, legacy: bool) -> Option<Self>;
}

impl DecodeProperty for String {
    fn decode(value: &Value, _legacy: bool) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl DecodeProperty for bool {
    fn decode(value: &Value, _legacy: bool) -> Option<Self> {
        value.as_bool()
    }
}

impl DecodeProperty for i64 {
    fn decode(value: &Value, _legacy: bool) -> Option<Self> {
        value.as_i64()
    }
}

impl DecodeProperty for u64 {
    fn decode(value: &Value, _legacy: bool) -> Option<Self> {
        value.as_u64()
    }
}

impl DecodeProperty for f64 {
    fn decode(value: &Value, _legacy: bool) -> Option<Self> {
        value.as_f64()
    }
}

/// Older payloads JSON-encoded these strings a second time
fn unquote(raw: &str) -> std::borrow::Cow<'_, str> {
    if raw.starts_with('"') {
        if let Ok(inner) = serde_json::from_str::<String>(raw) {
            return std::borrow::Cow::Owned(inner);
        }
    }
    std::borrow::Cow::Borrowed(raw)
}

impl DecodeProperty for SortKey {
    fn decode(value: &Value, _legacy: bool) -> Option<Self> {
        match value {
            Value::String(raw) => unquote(raw).parse().ok(),
            Value::Number(n) => n.as_u64().map(SortKey::from),
            _ => None,
        }
    }
}

impl DecodeProperty for DateTime<Utc> {
    fn decode(value: &Value, _legacy: bool) -> Option<Self> {
        match value {
            Value::String(raw) => parse_wire_time(&unquote(raw)),
            Value::Number(n) => n
                .as_i64()
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
            _ => None,
        }
    }
}

impl DecodeProperty for Value {
    fn decode(value: &Value, legacy: bool) -> Option<Self> {
        match value {
            Value::String(raw) if legacy => {
                Some(serde_json::from_str(raw).unwrap_or_else(|_| value.clone()))
            }
            other => Some(other.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_property_key_names() {
        assert_eq!(PropertyKey::from("trashed"), PropertyKey::Trashed);
        assert_eq!(
            PropertyKey::from("thumbnailAssetFingerprint"),
            PropertyKey::asset("thumbnail")
        );
        assert_eq!(
            PropertyKey::asset("content").to_string(),
            "contentAssetFingerprint"
        );
        assert_eq!(
            PropertyKey::from("AssetFingerprint"),
            PropertyKey::Other("AssetFingerprint".to_string())
        );
        assert_eq!(String::from(PropertyKey::from("zIndex")), "zIndex");
    }

    #[test]
    fn test_entry_distinguishes_null_from_absent() {
        let with_null: PropertyEntry =
            serde_json::from_value(json!({"value": null, "clientUpdatedTime": "2022-04-25T17:15:09Z"}))
                .unwrap();
        assert_eq!(with_null.value, Some(Value::Null));
        assert_eq!(with_null.value(), None);

        let absent: PropertyEntry =
            serde_json::from_value(json!({"clientUpdatedTime": "2022-04-25T17:15:09Z"})).unwrap();
        assert_eq!(absent.value, None);

        let out = serde_json::to_value(&with_null).unwrap();
        assert_eq!(out, json!({"value": null, "clientUpdatedTime": "2022-04-25T17:15:09Z"}));
    }

    #[test]
    fn test_wire_time_truncates_fractional_seconds() {
        let entry: PropertyEntry = serde_json::from_value(json!({
            "value": 1,
            "clientUpdatedTime": "2022-04-25T17:15:09.004Z",
            "serverUpdatedTime": "2022-04-25T17:15:10.500+00:00"
        }))
        .unwrap();
        assert_eq!(format_wire_time(&entry.client_updated_time), "2022-04-25T17:15:09Z");
        assert_eq!(
            entry.server_updated_time.map(|t| format_wire_time(&t)),
            Some("2022-04-25T17:15:10Z".to_string())
        );
    }

    #[test]
    fn test_legacy_encoding_stringifies_structures() {
        let value = PropertyValue::from(json!({"a": [1, 2]}));
        assert_eq!(
            value.clone().encode(true),
            Some(Value::String("{\"a\":[1,2]}".to_string()))
        );
        assert_eq!(value.encode(false), Some(json!({"a": [1, 2]})));
        assert_eq!(PropertyValue::from(Option::<String>::None).encode(false), None);
    }

    #[test]
    fn test_decode_double_encoded_values() {
        let key = Value::String("\"00000001:00001000\"".to_string());
        assert_eq!(
            SortKey::decode(&key, false),
            Some(SortKey::from_components(vec![1, 1000]))
        );

        let date = Value::String("\"2022-04-25T17:15:09Z\"".to_string());
        let decoded = DateTime::<Utc>::decode(&date, false).unwrap();
        assert_eq!(format_wire_time(&decoded), "2022-04-25T17:15:09Z");
    }

    #[test]
    fn test_decode_wrong_shape_is_none() {
        assert_eq!(String::decode(&json!(5), false), None);
        assert_eq!(bool::decode(&json!("true"), false), None);
        assert_eq!(DateTime::<Utc>::decode(&json!("not a date"), false), None);
    }

    #[test]
    fn test_legacy_value_decode_parses_json_text() {
        let stored = Value::String("[1,2,3]".to_string());
        assert_eq!(Value::decode(&stored, true), Some(json!([1, 2, 3])));
        assert_eq!(Value::decode(&stored, false), Some(stored.clone()));
    }
}
