//! Issuer key-set fetching and caching.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::{Error, Result};

#[cfg(feature = "fetch-reqwest")]
use crate::config::{JWKS_FETCH_TIMEOUT, TrustConfig};

/// A JWKS (JSON Web Key Set) as published by the issuer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JwksSet {
    /// Keys.
    pub keys: Vec<Jwk>,
}

/// Minimal JWK structure. Only RSA parameters are used for verification.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Jwk {
    /// Key type ("RSA", "EC", ...).
    pub kty: String,

    /// Key id.
    pub kid: Option<String>,

    /// Public key use.
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,

    /// Algorithm (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,

    /// RSA modulus.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// RSA exponent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

/// Where the key set comes from.
#[async_trait]
pub trait JwksFetcher: Send + Sync {
    async fn fetch(&self) -> Result<JwksSet>;
}

/// Fetches the key set over HTTP with a bounded timeout.
#[cfg(feature = "fetch-reqwest")]
#[derive(Debug, Clone)]
pub struct HttpJwksFetcher {
    client: reqwest::Client,
    url: String,
}

#[cfg(feature = "fetch-reqwest")]
impl HttpJwksFetcher {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(url, JWKS_FETCH_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Jwks(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[cfg(feature = "fetch-reqwest")]
#[async_trait]
impl JwksFetcher for HttpJwksFetcher {
    async fn fetch(&self) -> Result<JwksSet> {
        let resp = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| Error::Jwks(format!("unable to fetch {}: {e}", self.url)))?;

        if !resp.status().is_success() {
            return Err(Error::Jwks(format!(
                "fetch of {} failed: {}",
                self.url,
                resp.status()
            )));
        }

        resp.json::<JwksSet>()
            .await
            .map_err(|e| Error::Jwks(format!("invalid JWKS response from {}: {e}", self.url)))
    }
}

/// Serves a fixed key set. Useful for offline verification and tests.
#[derive(Debug, Clone)]
pub struct StaticJwksFetcher(pub JwksSet);

impl StaticJwksFetcher {
    /// Parse a JWKS JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map(Self)
            .map_err(|e| Error::Jwks(format!("invalid JWKS document: {e}")))
    }
}

#[async_trait]
impl JwksFetcher for StaticJwksFetcher {
    async fn fetch(&self) -> Result<JwksSet> {
        Ok(self.0.clone())
    }
}

type KeyIndex = Arc<HashMap<String, Jwk>>;

#[derive(Debug)]
struct CachedKeySet {
    keys: KeyIndex,
    fetched_at: Instant,
    /// Bumped on every successful fetch.
    generation: u64,
}

/// Caches the issuer's key set and resolves keys by `kid`.
///
/// A lookup refreshes at most once: either because the cache is empty or
/// expired, or because the `kid` is missing from a fresh set (key rotation).
/// When a refresh fails and an older set exists, the older set is served.
/// Concurrent refreshes are collapsed behind `refresh_gate`: callers that
/// queued behind a fetch reuse its outcome, success or failure.
pub struct KeyCache {
    fetcher: Arc<dyn JwksFetcher>,
    ttl: Duration,
    cached: RwLock<Option<CachedKeySet>>,
    /// Bumped after every fetch attempt, successful or not.
    attempts: AtomicU64,
    /// Holds the message of the last failed attempt.
    refresh_gate: Mutex<Option<String>>,
}

impl KeyCache {
    pub fn new(fetcher: Arc<dyn JwksFetcher>, ttl: Duration) -> Self {
        Self {
            fetcher,
            ttl,
            cached: RwLock::new(None),
            attempts: AtomicU64::new(0),
            refresh_gate: Mutex::new(None),
        }
    }

    /// Cache backed by the issuer's published key set.
    #[cfg(feature = "fetch-reqwest")]
    pub fn for_config(config: &TrustConfig) -> Result<Self> {
        let fetcher = HttpJwksFetcher::new(config.jwks_url())?;
        Ok(Self::new(Arc::new(fetcher), config.jwks_cache_ttl()))
    }

    /// Resolve the key published under `kid`.
    ///
    /// `Ok(None)` means the key set was available but has no such key.
    /// `Err` means no key set could be obtained at all.
    pub async fn get_key(&self, kid: &str) -> Result<Option<Jwk>> {
        let seen = {
            let cached = self.cached.read().await;
            match cached.as_ref() {
                Some(set) if set.fetched_at.elapsed() < self.ttl => {
                    if let Some(key) = set.keys.get(kid) {
                        return Ok(Some(key.clone()));
                    }
                    tracing::debug!(kid, "kid not in cached key set, forcing refresh");
                    Some(set.generation)
                }
                Some(set) => Some(set.generation),
                None => None,
            }
        };

        let keys = self.refresh_after(seen).await?;
        Ok(keys.get(kid).cloned())
    }

    /// Refetch the key set now. Returns the number of keys available afterwards.
    pub async fn refresh(&self) -> Result<usize> {
        let seen = self.cached.read().await.as_ref().map(|set| set.generation);
        Ok(self.refresh_after(seen).await?.len())
    }

    /// Key ids currently cached, sorted.
    pub async fn key_ids(&self) -> Vec<String> {
        let cached = self.cached.read().await;
        let mut ids: Vec<String> = cached
            .as_ref()
            .map(|set| set.keys.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    async fn refresh_after(&self, seen: Option<u64>) -> Result<KeyIndex> {
        let attempts_seen = self.attempts.load(Ordering::Acquire);
        let mut last_failure = self.refresh_gate.lock().await;

        {
            let cached = self.cached.read().await;
            if let Some(set) = cached.as_ref() {
                if seen.is_none_or(|generation| set.generation > generation) {
                    // Someone else refreshed while we waited on the gate.
                    return Ok(Arc::clone(&set.keys));
                }
            }
        }

        if self.attempts.load(Ordering::Acquire) != attempts_seen {
            // A fetch failed while we waited; do not repeat it.
            let message = last_failure
                .clone()
                .unwrap_or_else(|| "key set refresh failed".to_string());
            return self.serve_stale(Error::Jwks(message)).await;
        }

        let outcome = self.fetch_indexed().await;
        self.attempts.fetch_add(1, Ordering::AcqRel);

        match outcome {
            Ok(keys) => {
                *last_failure = None;
                let keys = Arc::new(keys);
                let mut cached = self.cached.write().await;
                let generation = cached.as_ref().map_or(1, |set| set.generation + 1);
                *cached = Some(CachedKeySet {
                    keys: Arc::clone(&keys),
                    fetched_at: Instant::now(),
                    generation,
                });
                tracing::info!(key_count = keys.len(), generation, "issuer key set refreshed");
                Ok(keys)
            }
            Err(err) => {
                *last_failure = Some(match &err {
                    Error::Jwks(message) => message.clone(),
                    other => other.to_string(),
                });
                self.serve_stale(err).await
            }
        }
    }

    /// Fall back to the last good set after a failed refresh.
    async fn serve_stale(&self, err: Error) -> Result<KeyIndex> {
        let cached = self.cached.read().await;
        if let Some(set) = cached.as_ref() {
            tracing::warn!(
                error = %err,
                key_count = set.keys.len(),
                "key set refresh failed, serving last known good keys"
            );
            Ok(Arc::clone(&set.keys))
        } else {
            tracing::error!(error = %err, "key set unavailable and nothing cached");
            Err(err)
        }
    }

    async fn fetch_indexed(&self) -> Result<HashMap<String, Jwk>> {
        let set = self.fetcher.fetch().await?;
        index_keys(set)
    }
}

impl std::fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCache").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

fn index_keys(set: JwksSet) -> Result<HashMap<String, Jwk>> {
    if set.keys.is_empty() {
        return Err(Error::Jwks("key set contains no keys".to_string()));
    }

    let mut keys = HashMap::with_capacity(set.keys.len());
    for key in set.keys {
        let kid = key
            .kid
            .clone()
            .filter(|kid| !kid.is_empty())
            .ok_or_else(|| Error::Jwks("key set entry missing kid".to_string()))?;
        // First entry wins on duplicate ids.
        keys.entry(kid).or_insert(key);
    }
    Ok(keys)
}
