//! Synchronization of records and assets with the remote store.
//!
//! This module provides:
//! - An HTTP `Transport` seam with a reqwest implementation
//! - Access-token management with single-flight refresh
//! - Batched record upload, paginated listing and multi-part blob upload
//! - A per-environment registry of clients

pub mod auth;
pub mod client;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use auth::{AccessToken, AuthEvent, TokenManager};
pub use client::{ListOptions, SyncClient, UploadProgress};
pub use registry::EndpointRegistry;
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};

use crate::asset::AssetError;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization.
///
/// Cloneable so one in-flight outcome can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Connection-level failure
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request cancelled")]
    Cancelled,

    /// Auth failure that survived one refresh and retry
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not signed in")]
    NotSignedIn,

    #[error("Token refresh failed: {0}")]
    TokenRefresh(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Response shape did not match the protocol; the raw body is attached
    #[error("Protocol violation: {message}")]
    Protocol { message: String, response: String },

    #[error("Record {id} rejected: {reason}")]
    RecordRejected { id: String, reason: String },

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Asset error: {0}")]
    Asset(#[from] AssetError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    pub(crate) fn protocol(message: impl Into<String>, response: &[u8]) -> Self {
        SyncError::Protocol {
            message: message.into(),
            response: String::from_utf8_lossy(response).into_owned(),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Network(err.to_string())
    }
}

/// Default number of records per batch post
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Configuration for the sync client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API root, e.g. `https://api.example.com`
    pub base_url: Url,
    /// Named environment (`None` = production)
    pub environment: Option<String>,
    pub client_id: String,
    pub secret_hash: String,
    /// Records per batch post
    pub batch_size: usize,
    /// Tokens are treated as expired this long before they actually expire
    pub token_expiry_margin: Duration,
    /// How long before expiry presigned URLs are refreshed in the background
    pub url_refresh_lead: Duration,
    /// Per-request timeout; `None` leaves timing to the transport
    pub request_timeout: Option<Duration>,
    /// Attempts for the public thumbnail upload
    pub thumbnail_upload_attempts: u32,
}

impl ClientConfig {
    /// Create a new config with required credentials
    pub fn new(base_url: Url, client_id: impl Into<String>, secret_hash: impl Into<String>) -> Self {
        Self {
            base_url,
            environment: None,
            client_id: client_id.into(),
            secret_hash: secret_hash.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            token_expiry_margin: Duration::from_secs(25),
            url_refresh_lead: crate::asset::remote::DEFAULT_REFRESH_LEAD,
            request_timeout: None,
            thumbnail_upload_attempts: 3,
        }
    }

    /// Create from environment variables
    pub fn from_env() -> SyncResult<Self> {
        let base_url = std::env::var("DECK_SYNC_BASE_URL")
            .map_err(|_| SyncError::Config("DECK_SYNC_BASE_URL is not set".to_string()))?;
        let base_url = Url::parse(&base_url)
            .map_err(|e| SyncError::Config(format!("Invalid DECK_SYNC_BASE_URL: {}", e)))?;
        let client_id = std::env::var("DECK_SYNC_CLIENT_ID")
            .map_err(|_| SyncError::Config("DECK_SYNC_CLIENT_ID is not set".to_string()))?;
        let secret_hash = std::env::var("DECK_SYNC_SECRET_HASH").unwrap_or_default();

        let mut config = Self::new(base_url, client_id, secret_hash);
        if let Ok(environment) = std::env::var("DECK_SYNC_ENV") {
            if !environment.is_empty() {
                config.environment = Some(environment);
            }
        }
        Ok(config)
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_token_expiry_margin(mut self, margin: Duration) -> Self {
        self.token_expiry_margin = margin;
        self
    }

    pub fn with_url_refresh_lead(mut self, lead: Duration) -> Self {
        self.url_refresh_lead = lead;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_thumbnail_upload_attempts(mut self, attempts: u32) -> Self {
        self.thumbnail_upload_attempts = attempts;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> SyncResult<()> {
        if self.client_id.is_empty() {
            return Err(SyncError::Config("Client ID is empty".to_string()));
        }
        if self.batch_size == 0 {
            return Err(SyncError::Config("Batch size must be positive".to_string()));
        }
        if self.thumbnail_upload_attempts == 0 {
            return Err(SyncError::Config(
                "Thumbnail upload attempts must be positive".to_string(),
            ));
        }
        if !matches!(self.base_url.scheme(), "http" | "https") {
            return Err(SyncError::Config(format!(
                "Unsupported base URL scheme: {}",
                self.base_url.scheme()
            )));
        }
        Ok(())
    }

    /// Resolve an API path against the base URL
    pub fn endpoint(&self, path: &str) -> SyncResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| SyncError::Config(format!("Invalid endpoint path {}: {}", path, e)))
    }
}
