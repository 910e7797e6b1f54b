//! JSON wire messages exchanged with the remote store.
//!
//! Paths are relative to the API base URL. Record bodies themselves are
//! [`RecordWire`](crate::record::RecordWire); this module covers the envelopes
//! around them plus the pagination loop guard.

use crate::record::{Record, RecordWire};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Root of the per-user sync API
pub const SYNC_BASE_PATH: &str = "/users/me/sync";

/// Batch post of records
pub const RECORDS_PATH: &str = "/users/me/sync/records";

/// Lookup of records by id
pub const RECORDS_BY_ID_PATH: &str = "/users/me/sync/records/ids";

/// Permanent removal of trashed records
pub const EXPUNGE_PATH: &str = "/users/me/sync/trash/delete/records";

/// Server error messages that mean the access token was rejected
pub const AUTH_FAILURE_MESSAGES: &[&str] = &["The incoming token has expired", "Unauthorized"];

/// Body of a batch post
#[derive(Debug, Clone, Serialize)]
pub struct BatchRequest {
    /// Client clock at send time, in wire format
    pub now: String,
    pub records: Vec<RecordWire>,
}

/// Response to a batch post; `results` is positional
#[derive(Debug, Clone, Deserialize)]
pub struct BatchResponse {
    #[serde(default)]
    pub results: Option<Vec<BatchResult>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchResult {
    #[serde(default)]
    pub status: Option<ResultStatus>,
    #[serde(default)]
    pub record: Option<RecordWire>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultStatus {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl BatchResult {
    /// Failure reason, or `None` if the server accepted the record
    pub fn failure(&self) -> Option<String> {
        match &self.status {
            Some(status) if status.success => None,
            Some(status) => Some(
                status
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "The server operation was unsuccessful".to_string()),
            ),
            None => Some("Server response did not include `status`".to_string()),
        }
    }
}

/// One page of a record listing, also the shape of a lookup by id
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPage {
    #[serde(default)]
    pub records: Option<Vec<Value>>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

impl RecordPage {
    /// Decode the page's records, skipping malformed entries
    pub fn decode_records(self) -> Vec<Record> {
        self.records
            .unwrap_or_default()
            .into_iter()
            .filter_map(|value| match Record::from_json(value) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping undecodable record: {}", e);
                    None
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IdsRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUploadRequest {
    pub content_type: String,
}

/// Upload plan returned by an asset's `initiateUploadUrl`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPlan {
    #[serde(default)]
    pub parts: Vec<UploadPart>,
    #[serde(default)]
    pub complete_upload_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPart {
    pub byte_range_start: u64,
    pub byte_range_length: u64,
    pub url: String,
}

impl UploadPart {
    /// Byte range of this part, clamped to `total`
    pub fn range(&self, total: usize) -> std::ops::Range<usize> {
        let start = usize::try_from(self.byte_range_start).unwrap_or(usize::MAX).min(total);
        let end = usize::try_from(self.byte_range_start.saturating_add(self.byte_range_length))
            .unwrap_or(usize::MAX)
            .min(total);
        start..end
    }
}

/// Completion body: part index to ETag
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompleteUploadRequest {
    pub etags: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default, alias = "Message")]
    message: Option<String>,
}

/// Error message carried in a JSON response body, if any
pub fn error_message(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<ErrorBody>(body).ok()?.message
}

/// Whether a response signals a rejected access token
pub fn is_auth_failure(status: u16, body: &[u8]) -> bool {
    status == 401
        || error_message(body)
            .map_or(false, |message| AUTH_FAILURE_MESSAGES.contains(&message.as_str()))
}

/// A presigned URL body, which the server sometimes JSON-quotes
pub fn parse_presigned_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.starts_with('"') {
        if let Ok(inner) = serde_json::from_str::<String>(trimmed) {
            return inner;
        }
    }
    trimmed.to_string()
}

/// Loop guard for continuation-token pagination.
///
/// Ends on a missing token, an empty token or a token repeated from the
/// previous page.
#[derive(Debug, Default)]
pub struct PageCursor {
    current: Option<String>,
    finished: bool,
}

impl PageCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token to send with the next request
    pub fn token(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Record the token returned by the last page; returns whether to fetch another
    pub fn advance(&mut self, next: Option<String>) -> bool {
        match next {
            None => self.finished = true,
            Some(token) if token.is_empty() => self.finished = true,
            Some(token) if self.current.as_deref() == Some(token.as_str()) => {
                debug!(token = %token, "Server repeated its page token; stopping");
                self.finished = true;
            }
            Some(token) => self.current = Some(token),
        }
        !self.finished
    }
}
