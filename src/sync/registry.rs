//! Registry of active sync clients, one per environment.
//!
//! Consumers receive the registry explicitly instead of reaching for a
//! process-wide list of endpoints.

use super::client::SyncClient;
use super::{ClientConfig, SyncResult, Transport};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Name used for the environment that has no explicit name
pub const PRODUCTION: &str = "production";

/// Active clients keyed by environment
#[derive(Default)]
pub struct EndpointRegistry {
    clients: DashMap<String, Arc<SyncClient>>,
}

fn environment_key(environment: Option<&str>) -> String {
    environment.unwrap_or(PRODUCTION).to_string()
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client under its configured environment, replacing any previous one
    pub fn insert(&self, client: SyncClient) -> Arc<SyncClient> {
        let key = environment_key(client.config().environment.as_deref());
        let client = Arc::new(client);
        if self.clients.insert(key.clone(), client.clone()).is_some() {
            info!(environment = %key, "Replaced sync endpoint");
        } else {
            info!(environment = %key, "Registered sync endpoint");
        }
        client
    }

    /// The client for `config`'s environment, creating it on first use
    pub fn get_or_create(
        &self,
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> SyncResult<Arc<SyncClient>> {
        let key = environment_key(config.environment.as_deref());
        if let Some(existing) = self.clients.get(&key) {
            return Ok(existing.clone());
        }
        let client = SyncClient::new(config, transport)?;
        Ok(self
            .clients
            .entry(key)
            .or_insert_with(|| Arc::new(client))
            .clone())
    }

    pub fn get(&self, environment: Option<&str>) -> Option<Arc<SyncClient>> {
        self.clients
            .get(&environment_key(environment))
            .map(|c| c.clone())
    }

    /// The production client, if registered
    pub fn production(&self) -> Option<Arc<SyncClient>> {
        self.get(None)
    }

    pub fn remove(&self, environment: Option<&str>) -> Option<Arc<SyncClient>> {
        let key = environment_key(environment);
        let removed = self.clients.remove(&key).map(|(_, client)| client);
        if removed.is_some() {
            info!(environment = %key, "Removed sync endpoint");
        }
        removed
    }

    pub fn environments(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
