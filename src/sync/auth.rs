//! Access tokens and single-flight token refresh.
//!
//! The access token is process-wide shared state. At most one refresh request
//! is in flight at a time; concurrent callers wait for the same outcome. A
//! failed refresh leaves the previous token in place and lets the caller
//! decide whether to sign out.

use super::transport::{HttpRequest, Transport};
use super::{ClientConfig, SyncError, SyncResult};
use crate::single_flight::SingleFlight;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

const REFRESH_PATH: &str = "/auth/tokens/refresh";

const EVENT_CAPACITY: usize = 16;

/// Credentials for authenticated requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    pub id_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl AccessToken {
    pub fn new(id_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            id_token: id_token.into(),
            refresh_token: refresh_token.into(),
            expires_at: None,
            user_id: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Whether the token expires within `margin` of `now`; tokens without an expiry never do
    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero());
        match self.expires_at {
            Some(expires_at) => expires_at <= now + margin,
            None => false,
        }
    }
}

/// Authentication state changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    TokenChanged(AccessToken),
    SignedOut,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    id_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    user: Option<RefreshUser>,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshUser {
    id: Option<String>,
}

/// Holds the current access token and refreshes it on demand
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    refresh_url: Url,
    client_id: String,
    secret_hash: String,
    margin: Duration,
    token: RwLock<Option<AccessToken>>,
    /// Bumped on every sign-in and sign-out, while holding the `token` write lock
    session: AtomicU64,
    refresh: SingleFlight<AccessToken, SyncError>,
    events: broadcast::Sender<AuthEvent>,
}

impl TokenManager {
    pub fn new(config: &ClientConfig, transport: Arc<dyn Transport>) -> SyncResult<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                refresh_url: config.endpoint(REFRESH_PATH)?,
                client_id: config.client_id.clone(),
                secret_hash: config.secret_hash.clone(),
                margin: config.token_expiry_margin,
                token: RwLock::new(None),
                session: AtomicU64::new(0),
                refresh: SingleFlight::new(),
                events,
            }),
        })
    }

    /// Install a token obtained elsewhere (sign-in flow, stored credentials)
    pub fn sign_in_with(&self, token: AccessToken) {
        info!(user_id = ?token.user_id, "Signed in");
        {
            let mut slot = self.inner.token.write();
            self.inner.session.fetch_add(1, Ordering::SeqCst);
            *slot = Some(token.clone());
        }
        let _ = self.inner.events.send(AuthEvent::TokenChanged(token));
    }

    pub fn sign_out(&self) {
        let previous = {
            let mut slot = self.inner.token.write();
            self.inner.session.fetch_add(1, Ordering::SeqCst);
            slot.take()
        };
        if previous.is_some() {
            info!("Signed out");
            let _ = self.inner.events.send(AuthEvent::SignedOut);
        }
    }

    pub fn current(&self) -> Option<AccessToken> {
        self.inner.token.read().clone()
    }

    pub fn is_signed_in(&self) -> bool {
        self.inner.token.read().is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events.subscribe()
    }

    /// A token that will not expire within the safety margin, refreshing if needed
    pub async fn valid_token(&self) -> SyncResult<AccessToken> {
        let token = self.current().ok_or(SyncError::NotSignedIn)?;
        if token.expires_within(self.inner.margin, Utc::now()) {
            debug!("Access token is about to expire");
            return self.refresh().await;
        }
        Ok(token)
    }

    /// Refresh the token; joins an in-flight refresh if there is one
    pub async fn refresh(&self) -> SyncResult<AccessToken> {
        let inner = self.inner.clone();
        self.inner
            .refresh
            .run(move || async move { inner.perform_refresh().await })
            .await
    }
}

impl Inner {
    /// Store a refreshed token unless the session changed since `session` was read
    fn store_refreshed(&self, token: AccessToken, session: u64) -> bool {
        {
            let mut slot = self.token.write();
            if slot.is_none() || self.session.load(Ordering::SeqCst) != session {
                return false;
            }
            *slot = Some(token.clone());
        }
        let _ = self.events.send(AuthEvent::TokenChanged(token));
        true
    }

    async fn perform_refresh(&self) -> SyncResult<AccessToken> {
        let (previous, session) = {
            let slot = self.token.read();
            let previous = slot.clone().ok_or(SyncError::NotSignedIn)?;
            (previous, self.session.load(Ordering::SeqCst))
        };
        info!("Refreshing access token");

        let body = json!({
            "refreshToken": previous.refresh_token,
            "clientID": self.client_id,
            "secretHash": self.secret_hash,
        });
        let request = HttpRequest::post(self.refresh_url.clone()).json(body);
        let response = self.transport.send(request).await.map_err(|e| {
            warn!("Token refresh request failed: {}", e);
            SyncError::TokenRefresh(e.to_string())
        })?;

        // Error bodies are not always JSON
        let payload = serde_json::from_slice::<RefreshResponse>(&response.body).ok();
        if let Some(RefreshResponse {
            code: Some(code),
            message,
            ..
        }) = &payload
        {
            let message = message.clone().unwrap_or_else(|| code.clone());
            warn!(status = response.status, "Token refresh rejected: {}", message);
            return Err(SyncError::TokenRefresh(message));
        }
        if !response.is_success() {
            warn!(status = response.status, "Unexpected status for token refresh");
            return Err(SyncError::TokenRefresh(format!(
                "Server returned unexpected response (code {})",
                response.status
            )));
        }
        let payload = payload
            .ok_or_else(|| SyncError::protocol("Undecodable refresh response", &response.body))?;
        let id_token = payload
            .id_token
            .ok_or_else(|| SyncError::protocol("Refresh response without idToken", &response.body))?;

        let refresh_token = payload.refresh_token.unwrap_or_else(|| {
            debug!("Refresh response did not include refreshToken; keeping the previous one");
            previous.refresh_token.clone()
        });
        let expires_at = payload
            .expires_in
            .and_then(chrono::Duration::try_seconds)
            .map(|ttl| Utc::now() + ttl);
        let user_id = payload.user.and_then(|u| u.id).or(previous.user_id);

        let token = AccessToken {
            id_token,
            refresh_token,
            expires_at,
            user_id,
        };
        if !self.store_refreshed(token.clone(), session) {
            warn!("Session changed during token refresh; discarding the new token");
            return Err(SyncError::NotSignedIn);
        }
        info!(expires_at = ?token.expires_at, "Refreshed access token");
        Ok(token)
    }
}
