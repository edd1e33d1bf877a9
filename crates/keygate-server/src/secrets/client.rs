// crates/keygate-server/src/secrets/client.rs
// Caching, background-refreshing client for the upstream secret store

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use keygate_types::CachedSecretInfo;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};

/// Header that tells the secret store this is an API client, opting out of
/// any browser-facing UI redirect.
const API_HEADER: &str = "sec-x-setec-api";

#[derive(Debug, Clone)]
struct CachedSecret {
    value: String,
    version: i64,
    fetched_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct SecretValueResponse {
    #[serde(alias = "Value", default)]
    value: String,
    #[serde(alias = "Version", default)]
    version: i64,
}

#[derive(Debug, Deserialize)]
struct SecretInfoResponse {
    #[serde(alias = "Name")]
    name: String,
    #[serde(alias = "Version", default)]
    version: i64,
}

/// Client for the secret-store HTTP JSON API.
///
/// `get` serves from the cache while an entry is younger than the poll
/// interval; a background loop keeps the configured secrets warm.
pub struct SecretClient {
    client: reqwest::Client,
    base_url: String,
    prefix: String,
    poll_interval: Duration,
    polled: Vec<String>,
    cache: Mutex<HashMap<String, CachedSecret>>,
}

impl SecretClient {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        prefix: impl Into<String>,
        poll_interval: Duration,
        polled: Vec<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            prefix: prefix.into(),
            poll_interval,
            polled,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Retrieve one secret. Returns `(value, cached)` where `cached` reports
    /// whether the value came from the local cache without a network call.
    pub async fn get(&self, name: &str) -> Result<(String, bool)> {
        if let Some(cached) = self.cache_fresh(name) {
            return Ok((cached.value, true));
        }
        let value = self.fetch(name).await?;
        Ok((value, false))
    }

    /// Enumerate secret names and versions. Never includes values.
    pub async fn list(&self) -> Result<Vec<CachedSecretInfo>> {
        let infos: Vec<SecretInfoResponse> = self.api_call("list", json!({})).await?;
        let now = Utc::now();
        Ok(infos
            .into_iter()
            .map(|i| CachedSecretInfo {
                name: i.name,
                version: i.version,
                fetched_at: now,
            })
            .collect())
    }

    /// Store one secret and prime the cache with the new value.
    pub async fn put(&self, name: &str, value: &str) -> Result<i64> {
        let encoded = BASE64.encode(value.as_bytes());
        let resp: SecretValueResponse = self
            .api_call("put", json!({"name": self.full_name(name), "value": encoded}))
            .await?;
        let version = if resp.version > 0 { resp.version } else { 1 };
        self.cache_put(name, value.to_string(), version);
        Ok(version)
    }

    /// Metadata for one secret.
    pub async fn info(&self, name: &str) -> Result<CachedSecretInfo> {
        let resp: SecretInfoResponse = self
            .api_call("info", json!({"name": self.full_name(name)}))
            .await?;
        Ok(CachedSecretInfo {
            name: resp.name,
            version: resp.version,
            fetched_at: Utc::now(),
        })
    }

    /// Refresh the polling list every interval until shutdown. Individual
    /// failures are logged and do not stop the loop.
    pub async fn poll_loop(self: std::sync::Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.polled.is_empty() {
            return;
        }
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for name in &self.polled {
                        match self.fetch(name).await {
                            Ok(_) => debug!(secret = %name, "Refreshed polled secret"),
                            Err(e) => warn!(secret = %name, error = %e, "Failed to refresh polled secret"),
                        }
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Fetch from the store, bypassing and then updating the cache.
    async fn fetch(&self, name: &str) -> Result<String> {
        let resp: SecretValueResponse = self
            .api_call("get", json!({"name": self.full_name(name)}))
            .await?;
        let value = decode_value(&resp.value);
        self.cache_put(name, value.clone(), resp.version);
        Ok(value)
    }

    async fn api_call<T: serde::de::DeserializeOwned>(
        &self,
        op: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let url = format!("{}/api/{}", self.base_url.trim_end_matches('/'), op);
        let resp = self
            .client
            .post(&url)
            .header(API_HEADER, "1")
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GatewayError::Secret(format!(
                "secret store {op} returned {status}"
            )));
        }
        Ok(resp.json::<T>().await?)
    }

    fn full_name(&self, name: &str) -> String {
        if name.starts_with(&self.prefix) {
            name.to_string()
        } else {
            format!("{}{}", self.prefix, name)
        }
    }

    fn cache_fresh(&self, name: &str) -> Option<CachedSecret> {
        let cache = self.lock();
        let entry = cache.get(name)?;
        let age = Utc::now().signed_duration_since(entry.fetched_at);
        if age.to_std().unwrap_or(Duration::MAX) < self.poll_interval {
            Some(entry.clone())
        } else {
            None
        }
    }

    fn cache_put(&self, name: &str, value: String, version: i64) {
        self.lock().insert(
            name.to_string(),
            CachedSecret {
                value,
                version,
                fetched_at: Utc::now(),
            },
        );
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CachedSecret>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Base64-decode when the payload decodes cleanly to UTF-8; otherwise the
/// raw body is the value.
fn decode_value(raw: &str) -> String {
    match BASE64.decode(raw.trim()) {
        Ok(bytes) => String::from_utf8(bytes).unwrap_or_else(|_| raw.to_string()),
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_client() -> SecretClient {
        // Port 9 (discard) is never listening; any network call errors fast.
        SecretClient::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            "keygate/",
            Duration::from_secs(300),
            vec![],
        )
    }

    #[test]
    fn test_decode_value_base64() {
        assert_eq!(decode_value("aGVsbG8="), "hello");
    }

    #[test]
    fn test_decode_value_raw_passthrough() {
        assert_eq!(decode_value("not$$base64!!"), "not$$base64!!");
    }

    #[test]
    fn test_full_name_prefixing() {
        let client = offline_client();
        assert_eq!(client.full_name("db-password"), "keygate/db-password");
        assert_eq!(client.full_name("keygate/db-password"), "keygate/db-password");
    }

    #[tokio::test]
    async fn test_get_serves_fresh_cache_without_network() {
        let client = offline_client();
        client.cache_put("db-password", "swordfish".into(), 3);

        // The base URL is unreachable, so a network attempt would error.
        let (value, cached) = client.get("db-password").await.unwrap();
        assert_eq!(value, "swordfish");
        assert!(cached);
    }

    #[tokio::test]
    async fn test_info_and_list_surface_upstream_errors() {
        let client = offline_client();
        assert!(client.info("db-password").await.is_err());
        assert!(client.list().await.is_err());
    }

    #[tokio::test]
    async fn test_get_stale_cache_goes_to_network() {
        let client = SecretClient::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            "",
            Duration::from_secs(0),
            vec![],
        );
        client.cache_put("k", "v".into(), 1);
        // Zero freshness window: the cached entry is already stale.
        assert!(client.get("k").await.is_err());
    }
}
