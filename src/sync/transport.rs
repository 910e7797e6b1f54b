//! HTTP transport seam.
//!
//! Everything the sync client sends goes through the `Transport` trait so the
//! network can be swapped out. `ReqwestTransport` is the production
//! implementation; tests use a scripted mock.

use super::{SyncError, SyncResult};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Body of an outgoing request
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Bytes { data: Bytes, content_type: String },
}

/// An outgoing HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: Url) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn bytes(mut self, data: Bytes, content_type: impl Into<String>) -> Self {
        self.body = RequestBody::Bytes {
            data,
            content_type: content_type.into(),
        };
        self
    }

    /// Replace any existing authorization header with a bearer token
    pub fn bearer(mut self, token: &str) -> Self {
        self.headers
            .retain(|(name, _)| !name.eq_ignore_ascii_case("authorization"));
        self.headers
            .push(("Authorization".to_string(), format!("Bearer {}", token)));
        self
    }

    pub fn json_body(&self) -> Option<&Value> {
        match &self.body {
            RequestBody::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// A received HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lowercased
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn json(status: u16, value: &Value) -> Self {
        Self::new(status, value.to_string())
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 2xx or 3xx
    pub fn is_ok_or_redirect(&self) -> bool {
        (200..400).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decode the body, attaching the raw response on failure
    pub fn decode<T: DeserializeOwned>(&self) -> SyncResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| SyncError::protocol(format!("Undecodable response: {}", e), &self.body))
    }

    /// Fail on statuses outside 2xx
    pub fn error_for_status(self) -> SyncResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(SyncError::Http {
                status: self.status,
                body: self.text(),
            })
        }
    }
}

/// Sends HTTP requests on behalf of the sync client
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse>;
}

/// Send a request, aborting it if `cancel` fires first
pub async fn send_cancellable(
    transport: &dyn Transport,
    request: HttpRequest,
    cancel: Option<&CancellationToken>,
) -> SyncResult<HttpResponse> {
    match cancel {
        Some(cancel) => {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(SyncError::Cancelled),
                response = transport.send(request) => response,
            }
        }
        None => transport.send(request).await,
    }
}

/// Transport backed by a shared `reqwest::Client`
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Option<Duration>) -> SyncResult<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        debug!(method = %request.method, url = %request.url, "Sending request");

        let mut builder = self.client.request(request.method, request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Bytes { data, content_type } => {
                builder.header("Content-Type", content_type).body(data)
            }
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;
    use serde_json::json;

    fn url() -> Url {
        Url::parse("https://api.example.com/users/me").unwrap()
    }

    #[test]
    fn test_bearer_replaces_existing_authorization() {
        let request = HttpRequest::get(url())
            .header("authorization", "Bearer old")
            .bearer("new");
        let auth: Vec<_> = request
            .headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("authorization"))
            .collect();
        assert_eq!(auth.len(), 1);
        assert_eq!(auth[0].1, "Bearer new");
    }

    #[test]
    fn test_response_helpers() {
        let response = HttpResponse::json(200, &json!({"ok": true})).with_header("ETag", "\"abc\"");
        assert!(response.is_success());
        assert_eq!(response.header("etag"), Some("\"abc\""));
        let value: Value = response.decode().unwrap();
        assert_eq!(value["ok"], true);

        let redirect = HttpResponse::new(302, "");
        assert!(!redirect.is_success());
        assert!(redirect.is_ok_or_redirect());
        assert!(matches!(
            redirect.error_for_status(),
            Err(SyncError::Http { status: 302, .. })
        ));
    }

    #[test]
    fn test_decode_failure_attaches_raw_body() {
        let response = HttpResponse::new(200, "not json");
        match response.decode::<Value>() {
            Err(SyncError::Protocol { response, .. }) => assert_eq!(response, "not json"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_request() {
        let transport = MockTransport::new(|_| Ok(HttpResponse::new(200, "")))
            .with_delay(Duration::from_secs(10));
        let cancel = CancellationToken::new();

        let pending = send_cancellable(&transport, HttpRequest::get(url()), Some(&cancel));
        let trigger = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        };
        let (result, _) = tokio::join!(pending, trigger);

        assert_eq!(result.unwrap_err(), SyncError::Cancelled);
    }
}
