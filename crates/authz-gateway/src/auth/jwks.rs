//! Key resolver backed by the identity provider's JWKS endpoint.
//!
//! Signing keys are cached per `kid` in a bounded TTL cache. On a miss the
//! whole key set is fetched and every usable key in it is cached, so a key
//! rotation costs one fetch rather than one per new `kid`.
//!
//! # Security
//!
//! - Fetches are rate limited independently of verification traffic, so a
//!   storm of tokens carrying unknown `kid` values cannot hammer the endpoint
//! - Concurrent misses for the same `kid` share a single in-flight fetch
//! - Keys already handed out stay valid for the verification using them even
//!   if the cache evicts the entry meanwhile

use crate::auth::rate_limit::FetchRateLimiter;
use crate::observability::metrics;
use jsonwebtoken::{Algorithm, DecodingKey};
use moka::future::Cache;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

/// Default number of cached signing keys.
pub const DEFAULT_MAX_ENTRIES: u64 = 5;

/// Default signing key TTL (1 hour).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Default key-set fetch budget per minute.
pub const DEFAULT_FETCHES_PER_MINUTE: u32 = 10;

/// JSON Web Key as published by the key-set endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key type: "RSA", "EC" or "OKP".
    pub kty: String,

    /// Key ID. Keys without one cannot be selected and are skipped.
    #[serde(default)]
    pub kid: Option<String>,

    #[serde(default)]
    pub alg: Option<String>,

    /// Key use; only "sig" (or absent) keys are accepted.
    #[serde(default, rename = "use")]
    pub key_use: Option<String>,

    /// RSA modulus (base64url).
    #[serde(default)]
    pub n: Option<String>,

    /// RSA public exponent (base64url).
    #[serde(default)]
    pub e: Option<String>,

    /// Curve name for EC and OKP keys.
    #[serde(default)]
    pub crv: Option<String>,

    #[serde(default)]
    pub x: Option<String>,

    #[serde(default)]
    pub y: Option<String>,
}

/// JWKS document.
#[derive(Debug, Clone, Deserialize)]
pub struct JwksResponse {
    pub keys: Vec<Jwk>,
}

/// A resolved public key, bound to the single algorithm it verifies.
#[derive(Clone)]
pub struct SigningKey {
    pub kid: String,
    pub algorithm: Algorithm,
    pub key: DecodingKey,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Key resolution errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyResolveError {
    /// The key set was fetched but holds no usable key with this `kid`.
    #[error("Signing key not found: {0}")]
    KeyNotFound(String),

    /// The key-set endpoint could not be reached or returned garbage.
    #[error("Key set fetch failed: {0}")]
    KeyFetch(String),

    /// The fetch budget for the current window is spent.
    #[error("Key set fetch rate limit exceeded")]
    RateLimited,
}

/// Key resolver settings.
#[derive(Debug, Clone)]
pub struct KeyResolverConfig {
    pub jwks_url: String,
    pub max_entries: u64,
    pub ttl: Duration,
    pub fetches_per_window: u32,
    pub window: Duration,
    pub http_timeout: Duration,
}

impl KeyResolverConfig {
    pub fn new(jwks_url: impl Into<String>) -> Self {
        Self {
            jwks_url: jwks_url.into(),
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl: DEFAULT_CACHE_TTL,
            fetches_per_window: DEFAULT_FETCHES_PER_MINUTE,
            window: Duration::from_secs(60),
            http_timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub fn with_max_entries(mut self, max_entries: u64) -> Self {
        self.max_entries = max_entries;
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, fetches: u32, window: Duration) -> Self {
        self.fetches_per_window = fetches;
        self.window = window;
        self
    }
}

/// Resolves `kid` values to signing keys.
pub struct KeyResolver {
    jwks_url: String,
    http_client: reqwest::Client,
    cache: Cache<String, Arc<SigningKey>>,
    limiter: FetchRateLimiter,
}

impl KeyResolver {
    pub fn new(config: KeyResolverConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(target: "gatehouse.auth.jwks", error = %e, "Failed to build HTTP client with custom config, using defaults");
                reqwest::Client::new()
            });

        Self {
            jwks_url: config.jwks_url,
            http_client,
            cache: Cache::builder()
                .time_to_live(config.ttl)
                .max_capacity(config.max_entries)
                .build(),
            limiter: FetchRateLimiter::new(config.fetches_per_window, config.window),
        }
    }

    /// Resolve a `kid` to its signing key.
    ///
    /// # Errors
    ///
    /// - `KeyNotFound` if the freshly fetched key set has no usable key for `kid`
    /// - `KeyFetch` if the key-set endpoint fails
    /// - `RateLimited` if a fetch is needed but the budget is spent
    #[instrument(skip(self), fields(kid = %kid))]
    pub async fn resolve(&self, kid: &str) -> Result<Arc<SigningKey>, KeyResolveError> {
        if let Some(key) = self.cache.get(kid).await {
            tracing::debug!(target: "gatehouse.auth.jwks", "JWKS cache hit");
            return Ok(key);
        }

        self.cache
            .try_get_with(kid.to_string(), self.fetch_key(kid))
            .await
            .map_err(|e| (*e).clone())
    }

    async fn fetch_key(&self, kid: &str) -> Result<Arc<SigningKey>, KeyResolveError> {
        if let Err(retry_after) = self.limiter.try_acquire() {
            tracing::warn!(
                target: "gatehouse.auth.jwks",
                kid = %kid,
                retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                "JWKS fetch rate limit exceeded"
            );
            metrics::record_jwks_fetch("rate_limited");
            return Err(KeyResolveError::RateLimited);
        }

        let jwks = match self.fetch_key_set().await {
            Ok(jwks) => {
                metrics::record_jwks_fetch("success");
                jwks
            }
            Err(e) => {
                metrics::record_jwks_fetch("error");
                return Err(e);
            }
        };

        let mut requested = None;
        let mut usable = 0_usize;
        for jwk in &jwks.keys {
            let Some(key) = signing_key_from_jwk(jwk) else {
                continue;
            };
            usable += 1;
            let key = Arc::new(key);
            if key.kid == kid {
                requested = Some(key);
            } else {
                // the requested kid is inserted by try_get_with itself
                self.cache.insert(key.kid.clone(), key).await;
            }
        }

        tracing::info!(
            target: "gatehouse.auth.jwks",
            key_count = jwks.keys.len(),
            usable_keys = usable,
            "JWKS fetched"
        );

        requested.ok_or_else(|| {
            tracing::warn!(target: "gatehouse.auth.jwks", kid = %kid, "Key not found in JWKS");
            KeyResolveError::KeyNotFound(kid.to_string())
        })
    }

    async fn fetch_key_set(&self) -> Result<JwksResponse, KeyResolveError> {
        tracing::debug!(target: "gatehouse.auth.jwks", url = %self.jwks_url, "Fetching JWKS");

        let response = self
            .http_client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(target: "gatehouse.auth.jwks", error = %e, "Failed to fetch JWKS");
                KeyResolveError::KeyFetch(format!("request failed: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!(target: "gatehouse.auth.jwks", status = %status, "JWKS endpoint returned error");
            return Err(KeyResolveError::KeyFetch(format!("endpoint returned {status}")));
        }

        response.json::<JwksResponse>().await.map_err(|e| {
            tracing::error!(target: "gatehouse.auth.jwks", error = %e, "Failed to parse JWKS response");
            KeyResolveError::KeyFetch(format!("invalid key set: {e}"))
        })
    }
}

/// Build a signing key from a JWK, or `None` if it cannot be used for
/// signature verification.
fn signing_key_from_jwk(jwk: &Jwk) -> Option<SigningKey> {
    let kid = jwk.kid.as_deref().filter(|k| !k.is_empty())?;

    if jwk.key_use.as_deref().is_some_and(|u| u != "sig") {
        tracing::debug!(target: "gatehouse.auth.jwks", kid = %kid, "Skipping non-signing key");
        return None;
    }

    let algorithm = match jwk_algorithm(jwk) {
        Some(algorithm) => algorithm,
        None => {
            tracing::debug!(
                target: "gatehouse.auth.jwks",
                kid = %kid,
                kty = %jwk.kty,
                alg = ?jwk.alg,
                "Skipping key with unsupported algorithm"
            );
            return None;
        }
    };

    let key = match jwk.kty.as_str() {
        "RSA" => DecodingKey::from_rsa_components(jwk.n.as_deref()?, jwk.e.as_deref()?),
        "EC" => DecodingKey::from_ec_components(jwk.x.as_deref()?, jwk.y.as_deref()?),
        "OKP" => DecodingKey::from_ed_components(jwk.x.as_deref()?),
        _ => return None,
    };

    match key {
        Ok(key) => Some(SigningKey {
            kid: kid.to_string(),
            algorithm,
            key,
        }),
        Err(e) => {
            tracing::debug!(target: "gatehouse.auth.jwks", kid = %kid, error = %e, "Skipping key with invalid material");
            None
        }
    }
}

/// Algorithm a JWK verifies: its `alg` if present, else the family default.
/// The algorithm must belong to the key's family.
fn jwk_algorithm(jwk: &Jwk) -> Option<Algorithm> {
    let family_default = match (jwk.kty.as_str(), jwk.crv.as_deref()) {
        ("RSA", _) => Algorithm::RS256,
        ("EC", Some("P-256")) => Algorithm::ES256,
        ("EC", Some("P-384")) => Algorithm::ES384,
        ("OKP", Some("Ed25519")) => Algorithm::EdDSA,
        _ => return None,
    };

    let algorithm = match jwk.alg.as_deref() {
        Some(alg) => Algorithm::from_str(alg).ok()?,
        None => return Some(family_default),
    };

    let consistent = match jwk.kty.as_str() {
        "RSA" => matches!(
            algorithm,
            Algorithm::RS256
                | Algorithm::RS384
                | Algorithm::RS512
                | Algorithm::PS256
                | Algorithm::PS384
                | Algorithm::PS512
        ),
        "EC" | "OKP" => algorithm == family_default,
        _ => false,
    };

    consistent.then_some(algorithm)
}
