//! JWKS (JSON Web Key Set) fetching and caching
//!
//! The resolver keeps one [`KeySet`] per issuer in a [`KeySetCache`]:
//!
//! - **Lock-free reads**: the current set lives in an `ArcSwapOption` and is replaced
//!   wholesale, so readers see the old set or the new one, never a mix
//! - **Refresh on miss**: an unknown key ID triggers one refetch, because keys rotate
//! - **Rate limiting**: at most one fetch per cooldown window, so key-ID churn cannot turn
//!   every request into a request to the authorization server
//! - **Coalescing**: refreshes for one issuer are serialized, and callers that waited behind an
//!   in-flight fetch re-check the new set before fetching again
//! - **TTL**: a set older than the cache TTL keeps serving known keys while one background
//!   task refetches it; only key-ID misses wait for a fetch

use crate::error::{ConfigError, TokenError};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

/// Key discovery path below the issuer base URL (Keycloak layout)
pub const DEFAULT_CERTS_PATH: &str = "/protocol/openid-connect/certs";

/// Public key material of a signing key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMaterial {
    /// RSA public key, big-endian without leading zeros
    Rsa {
        /// Modulus
        n: Vec<u8>,
        /// Public exponent
        e: Vec<u8>,
    },
    /// Elliptic curve public key (no scheme registered for it yet)
    Ec {
        /// Curve name (P-256, P-384, P-521)
        crv: String,
        /// X coordinate
        x: Vec<u8>,
        /// Y coordinate
        y: Vec<u8>,
    },
}

impl KeyMaterial {
    /// JOSE key type name
    pub fn key_type(&self) -> &'static str {
        match self {
            Self::Rsa { .. } => "RSA",
            Self::Ec { .. } => "EC",
        }
    }
}

/// A public signing key from an issuer's key set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningKey {
    kid: String,
    algorithm: Option<String>,
    material: KeyMaterial,
}

impl SigningKey {
    /// Create a signing key
    pub fn new(kid: impl Into<String>, material: KeyMaterial) -> Self {
        Self {
            kid: kid.into(),
            algorithm: None,
            material,
        }
    }

    /// Create an RSA signing key from big-endian modulus and exponent bytes
    pub fn rsa(kid: impl Into<String>, n: &[u8], e: &[u8]) -> Self {
        Self::new(
            kid,
            KeyMaterial::Rsa {
                n: strip_leading_zeros(n).to_vec(),
                e: strip_leading_zeros(e).to_vec(),
            },
        )
    }

    /// Restrict the key to one algorithm (the JWK `alg` parameter)
    pub fn with_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.algorithm = Some(algorithm.into());
        self
    }

    /// Key ID
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Algorithm the key is restricted to, if the issuer published one
    pub fn algorithm(&self) -> Option<&str> {
        self.algorithm.as_deref()
    }

    /// Public key material
    pub fn material(&self) -> &KeyMaterial {
        &self.material
    }

    fn from_jwk(jwk: &Jwk) -> Result<Self, String> {
        let kid = jwk.kid.as_deref().filter(|kid| !kid.is_empty()).ok_or("missing kid")?;

        if let Some(key_use) = jwk.key_use.as_deref()
            && key_use != "sig"
        {
            return Err(format!("key use '{key_use}' is not 'sig'"));
        }

        let material = match jwk.kty.as_str() {
            "RSA" => {
                let n = decode_param(jwk.n.as_deref(), "n")?;
                let e = decode_param(jwk.e.as_deref(), "e")?;
                KeyMaterial::Rsa {
                    n: strip_leading_zeros(&n).to_vec(),
                    e: strip_leading_zeros(&e).to_vec(),
                }
            }
            "EC" => KeyMaterial::Ec {
                crv: jwk.crv.clone().ok_or("EC key missing 'crv' parameter")?,
                x: decode_param(jwk.x.as_deref(), "x")?,
                y: decode_param(jwk.y.as_deref(), "y")?,
            },
            other => return Err(format!("unsupported key type '{other}'")),
        };

        Ok(Self {
            kid: kid.to_string(),
            algorithm: jwk.alg.clone(),
            material,
        })
    }
}

fn decode_param(value: Option<&str>, name: &str) -> Result<Vec<u8>, String> {
    let value = value.ok_or_else(|| format!("missing '{name}' parameter"))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| format!("'{name}' is not base64url: {e}"))?;
    if bytes.is_empty() {
        return Err(format!("'{name}' is empty"));
    }
    Ok(bytes)
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// JSON Web Key as published by the issuer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    /// Key Type (RSA, EC, oct, OKP)
    pub kty: String,

    /// Key ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    /// Public Key Use (sig, enc)
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,

    /// Algorithm (RS256, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,

    /// RSA modulus (base64url)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,

    /// RSA exponent (base64url)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,

    /// Elliptic curve name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,

    /// EC X coordinate (base64url)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,

    /// EC Y coordinate (base64url)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

#[derive(Deserialize)]
struct JwkSetDocument {
    keys: Vec<serde_json::Value>,
}

/// Signing keys of one issuer, indexed by key ID
#[derive(Debug, Clone)]
pub struct KeySet {
    keys: HashMap<String, Arc<SigningKey>>,
    fetched_at: Instant,
}

impl KeySet {
    /// Build a key set; the first key wins when key IDs repeat
    pub fn new(keys: impl IntoIterator<Item = SigningKey>) -> Self {
        let mut map = HashMap::new();
        for key in keys {
            if map.contains_key(key.kid()) {
                debug!(key_id = key.kid(), "Duplicate key ID in key set, keeping first");
                continue;
            }
            map.insert(key.kid().to_string(), Arc::new(key));
        }

        Self {
            keys: map,
            fetched_at: Instant::now(),
        }
    }

    /// Parse a JWKS document, skipping keys that cannot be used for verification
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::KeySourceUnavailable`] if the body is not a JSON object with a
    /// `keys` array.
    pub fn from_jwks_json(body: &[u8]) -> Result<Self, TokenError> {
        let document: JwkSetDocument = serde_json::from_slice(body)
            .map_err(|e| TokenError::key_source(format!("Invalid JWKS format: {e}")))?;

        let keys = document.keys.into_iter().filter_map(|value| {
            let jwk: Jwk = match serde_json::from_value(value) {
                Ok(jwk) => jwk,
                Err(e) => {
                    debug!(error = %e, "Skipping unparseable JWK");
                    return None;
                }
            };
            match SigningKey::from_jwk(&jwk) {
                Ok(key) => Some(key),
                Err(reason) => {
                    debug!(key_id = ?jwk.kid, kty = %jwk.kty, reason = %reason, "Skipping JWK");
                    None
                }
            }
        });

        Ok(Self::new(keys))
    }

    /// Look up a key by exact key ID
    pub fn get(&self, kid: &str) -> Option<Arc<SigningKey>> {
        self.keys.get(kid).cloned()
    }

    /// Key IDs in the set
    pub fn key_ids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// Number of usable keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set has no usable keys
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Time since the set was fetched
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }
}

/// Where key sets come from
///
/// [`HttpKeySource`] is the production implementation; tests and alternative transports
/// provide their own.
#[async_trait]
pub trait KeySource: Send + Sync + std::fmt::Debug {
    /// Fetch the current key set published at `certs_url`
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::KeySourceUnavailable`] if the key set cannot be fetched or parsed.
    async fn fetch(&self, certs_url: &str) -> Result<KeySet, TokenError>;
}

/// Fetches key sets over HTTP(S)
#[derive(Debug, Clone)]
pub struct HttpKeySource {
    client: reqwest::Client,
}

impl HttpKeySource {
    /// Create a source whose requests time out after `timeout`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::HttpClient`] if the TLS backend cannot be initialized.
    pub fn new(timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self { client })
    }

    /// Use an existing client (its timeout bounds every fetch)
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch(&self, certs_url: &str) -> Result<KeySet, TokenError> {
        info!(jwks_uri = %certs_url, "Fetching JWKS from endpoint");

        let response = self.client.get(certs_url).send().await.map_err(|e| {
            error!(jwks_uri = %certs_url, error = %e, "Failed to fetch JWKS");
            TokenError::key_source(format!("JWKS fetch failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            error!(jwks_uri = %certs_url, status = %status, "JWKS endpoint returned error status");
            return Err(TokenError::key_source(format!(
                "JWKS endpoint returned status {status}"
            )));
        }

        let body = response.bytes().await.map_err(|e| {
            error!(jwks_uri = %certs_url, error = %e, "Failed to read JWKS body");
            TokenError::key_source(format!("JWKS body unreadable: {e}"))
        })?;

        let key_set = KeySet::from_jwks_json(&body).inspect_err(|e| {
            error!(jwks_uri = %certs_url, error = %e, "Failed to parse JWKS JSON");
        })?;

        info!(
            jwks_uri = %certs_url,
            key_count = key_set.len(),
            "Successfully fetched JWKS"
        );
        Ok(key_set)
    }
}

#[derive(Debug, Default)]
struct RefreshState {
    last_attempt: Option<Instant>,
    last_error: Option<TokenError>,
}

#[derive(Debug)]
struct CacheEntry {
    current: ArcSwapOption<KeySet>,
    refresh: Mutex<RefreshState>,
}

impl Default for CacheEntry {
    fn default() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            refresh: Mutex::new(RefreshState::default()),
        }
    }
}

/// Key sets for any number of issuers, keyed by discovery URL
///
/// Owned explicitly and shared through `Arc`; resolvers for several issuers (or test doubles)
/// can use one cache or separate ones.
#[derive(Debug, Default)]
pub struct KeySetCache {
    entries: DashMap<String, Arc<CacheEntry>>,
}

impl KeySetCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, certs_url: &str) -> Arc<CacheEntry> {
        if let Some(entry) = self.entries.get(certs_url) {
            return Arc::clone(entry.value());
        }
        Arc::clone(self.entries.entry(certs_url.to_string()).or_default().value())
    }

    /// Current key set for a discovery URL
    pub fn get(&self, certs_url: &str) -> Option<Arc<KeySet>> {
        self.entries
            .get(certs_url)
            .and_then(|entry| entry.current.load_full())
    }

    /// Publish a key set for a discovery URL, replacing the previous one
    pub fn insert(&self, certs_url: &str, key_set: KeySet) {
        self.entry(certs_url).current.store(Some(Arc::new(key_set)));
    }

    /// Drop the key set for a discovery URL
    ///
    /// The refresh cooldown restarts too, so the next lookup fetches immediately.
    pub fn invalidate(&self, certs_url: &str) {
        if let Some(entry) = self.entries.get(certs_url) {
            entry.current.store(None);
            // A refresh holding the lock publishes a new set anyway
            if let Ok(mut state) = entry.refresh.try_lock() {
                *state = RefreshState::default();
            }
            debug!(jwks_uri = %certs_url, "JWKS cache cleared");
        }
    }

    /// Number of issuers with an entry
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no issuer has an entry
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Key resolver tuning
#[derive(Debug, Clone)]
pub struct KeyResolverOptions {
    /// Path appended to the issuer base URL
    pub certs_path: String,
    /// Minimum time between two fetches for one issuer
    pub refresh_cooldown: Duration,
    /// Age after which a cached set is refetched
    pub cache_ttl: Duration,
    /// Network timeout for one fetch
    pub fetch_timeout: Duration,
}

impl Default for KeyResolverOptions {
    fn default() -> Self {
        Self {
            certs_path: DEFAULT_CERTS_PATH.to_string(),
            refresh_cooldown: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(600),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

/// Resolves key IDs to signing keys for one issuer
///
/// # Example
///
/// ```rust,no_run
/// # use tokengate::jwt::{KeyResolver, KeyResolverOptions};
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let resolver = KeyResolver::new(
///     "https://keycloak.example.com/realms/gamify",
///     KeyResolverOptions::default(),
/// )?;
/// let key = resolver.resolve("8f2kLx").await?;
/// println!("{} key {}", key.material().key_type(), key.kid());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct KeyResolver {
    certs_url: String,
    source: Arc<dyn KeySource>,
    cache: Arc<KeySetCache>,
    refresh_cooldown: Duration,
    cache_ttl: Duration,
}

impl KeyResolver {
    /// Create a resolver fetching over HTTP with a private cache
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidIssuerConfiguration`] if the issuer base URL is empty or
    /// not an absolute http(s) URL, or [`ConfigError::HttpClient`] if the HTTP client cannot
    /// be built.
    pub fn new(issuer_base_url: &str, options: KeyResolverOptions) -> Result<Self, ConfigError> {
        let source = HttpKeySource::new(options.fetch_timeout)?;
        Self::with_source(
            issuer_base_url,
            options,
            Arc::new(source),
            Arc::new(KeySetCache::new()),
        )
    }

    /// Create a resolver with an injected key source and cache
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidIssuerConfiguration`] if the issuer base URL is invalid.
    pub fn with_source(
        issuer_base_url: &str,
        options: KeyResolverOptions,
        source: Arc<dyn KeySource>,
        cache: Arc<KeySetCache>,
    ) -> Result<Self, ConfigError> {
        let certs_url = certs_url(issuer_base_url, &options.certs_path)?;
        info!(jwks_uri = %certs_url, "Using issuer key set endpoint");

        Ok(Self {
            certs_url,
            source,
            cache,
            refresh_cooldown: options.refresh_cooldown,
            cache_ttl: options.cache_ttl,
        })
    }

    /// The key discovery endpoint
    pub fn certs_url(&self) -> &str {
        &self.certs_url
    }

    /// The cache this resolver publishes into
    pub fn cache(&self) -> &Arc<KeySetCache> {
        &self.cache
    }

    /// Resolve a key ID to a signing key
    ///
    /// Cached keys are returned without waiting on a fetch, even once the set has outlived the
    /// cache TTL (a background task refetches it). A miss refreshes the set at most once per
    /// cooldown.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::KeyNotFound`] if the key is absent after refresh (or a refresh is
    /// not allowed yet), and [`TokenError::KeySourceUnavailable`] if the fetch fails.
    pub async fn resolve(&self, kid: &str) -> Result<Arc<SigningKey>, TokenError> {
        let entry = self.cache.entry(&self.certs_url);

        if let Some(key_set) = entry.current.load_full()
            && let Some(key) = key_set.get(kid)
        {
            if key_set.age() < self.cache_ttl {
                debug!(jwks_uri = %self.certs_url, key_id = kid, "Using cached JWKS");
            } else {
                self.refresh_in_background(Arc::clone(&entry));
            }
            return Ok(key);
        }

        self.refresh_and_resolve(&entry, kid).await
    }

    async fn refresh_and_resolve(
        &self,
        entry: &CacheEntry,
        kid: &str,
    ) -> Result<Arc<SigningKey>, TokenError> {
        let mut state = entry.refresh.lock().await;

        // Another caller may have refreshed while we waited for the lock
        let cached = entry.current.load_full();
        if let Some(key) = cached.as_ref().and_then(|set| set.get(kid)) {
            return Ok(key);
        }

        if self.cooling_down(&state, cached.is_some()) {
            warn!(
                jwks_uri = %self.certs_url,
                key_id = kid,
                "JWKS refresh rate limited, using cache"
            );
            return Err(match (&cached, &state.last_error) {
                (None, Some(last_error)) => last_error.clone(),
                _ => key_not_found(kid),
            });
        }

        let key_set = self.fetch_into(entry, &mut state).await?;
        key_set.get(kid).ok_or_else(|| {
            warn!(
                jwks_uri = %self.certs_url,
                key_id = kid,
                "Key ID not found in JWKS after refresh"
            );
            key_not_found(kid)
        })
    }

    /// Refetch an expired set without holding up the caller
    fn refresh_in_background(&self, entry: Arc<CacheEntry>) {
        match entry.refresh.try_lock() {
            Ok(state) if !self.cooling_down(&state, true) => {}
            // Already refreshing, or the last attempt was too recent
            _ => return,
        }

        let resolver = self.clone();
        tokio::spawn(async move {
            let Ok(mut state) = entry.refresh.try_lock() else {
                return;
            };
            let expired = entry
                .current
                .load_full()
                .is_none_or(|set| set.age() >= resolver.cache_ttl);
            if !expired || resolver.cooling_down(&state, true) {
                return;
            }

            debug!(jwks_uri = %resolver.certs_url, "JWKS cache expired, refreshing");
            if let Err(e) = resolver.fetch_into(&entry, &mut state).await {
                warn!(
                    jwks_uri = %resolver.certs_url,
                    error = %e,
                    "JWKS refresh failed, serving stale keys"
                );
            }
        });
    }

    /// Whether the last fetch attempt is too recent to try again
    ///
    /// An entry with no set and no recorded failure was invalidated and may fetch at once.
    fn cooling_down(&self, state: &RefreshState, has_set: bool) -> bool {
        if !has_set && state.last_error.is_none() {
            return false;
        }
        state
            .last_attempt
            .is_some_and(|last| last.elapsed() < self.refresh_cooldown)
    }

    /// Fetch and publish a new set; the caller holds the refresh lock
    async fn fetch_into(
        &self,
        entry: &CacheEntry,
        state: &mut RefreshState,
    ) -> Result<Arc<KeySet>, TokenError> {
        state.last_attempt = Some(Instant::now());
        match self.source.fetch(&self.certs_url).await {
            Ok(key_set) => {
                state.last_error = None;
                let key_set = Arc::new(key_set);
                entry.current.store(Some(Arc::clone(&key_set)));
                Ok(key_set)
            }
            Err(fetch_error) => {
                state.last_error = Some(fetch_error.clone());
                Err(fetch_error)
            }
        }
    }

    /// Fetch the key set now, ignoring cache age and cooldown
    ///
    /// Useful at startup to fail early when the issuer is unreachable.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::KeySourceUnavailable`] if the fetch fails.
    pub async fn prefetch(&self) -> Result<usize, TokenError> {
        let entry = self.cache.entry(&self.certs_url);
        let mut state = entry.refresh.lock().await;
        let key_set = self.fetch_into(&entry, &mut state).await?;
        Ok(key_set.len())
    }

    /// Drop the cached key set for this issuer
    pub fn invalidate(&self) {
        self.cache.invalidate(&self.certs_url);
    }
}

fn key_not_found(kid: &str) -> TokenError {
    TokenError::KeyNotFound {
        kid: kid.to_string(),
    }
}

/// Derive the key discovery URL from the issuer base URL
fn certs_url(issuer_base_url: &str, certs_path: &str) -> Result<String, ConfigError> {
    let base = issuer_base_url.trim();
    if base.is_empty() {
        return Err(ConfigError::invalid_issuer("issuer base URL is empty"));
    }

    let parsed = Url::parse(base).map_err(|e| {
        ConfigError::invalid_issuer(format!("illegal issuer base URL \"{base}\": {e}"))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::invalid_issuer(format!(
            "issuer base URL must use http or https, got \"{}\"",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(ConfigError::invalid_issuer(format!(
            "issuer base URL \"{base}\" has no host"
        )));
    }
    if parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(ConfigError::invalid_issuer(format!(
            "issuer base URL \"{base}\" must not carry a query or fragment"
        )));
    }

    let path = certs_path.trim_start_matches('/');
    Ok(format!("{}/{}", base.trim_end_matches('/'), path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BASE: &str = "https://keycloak.example.com/realms/gamify";

    /// Key source answering from a script of key-ID lists
    #[derive(Debug, Default)]
    struct ScriptedSource {
        script: std::sync::Mutex<VecDeque<Result<Vec<&'static str>, String>>>,
        fetches: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Vec<&'static str>, String>>) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(script.into()),
                ..Default::default()
            })
        }

        fn with_delay(
            script: Vec<Result<Vec<&'static str>, String>>,
            delay: Duration,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(script.into()),
                fetches: AtomicUsize::new(0),
                delay,
            })
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KeySource for ScriptedSource {
        async fn fetch(&self, _certs_url: &str) -> Result<KeySet, TokenError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(kids)) => Ok(KeySet::new(
                    kids.into_iter()
                        .map(|kid| SigningKey::rsa(kid, &[0xC5; 256], &[1, 0, 1])),
                )),
                Some(Err(reason)) => Err(TokenError::key_source(reason)),
                None => Err(TokenError::key_source("script exhausted")),
            }
        }
    }

    fn resolver(source: Arc<ScriptedSource>, cooldown: Duration) -> KeyResolver {
        let options = KeyResolverOptions {
            refresh_cooldown: cooldown,
            ..Default::default()
        };
        KeyResolver::with_source(BASE, options, source, Arc::new(KeySetCache::new())).unwrap()
    }

    fn b64(bytes: &[u8]) -> String {
        URL_SAFE_NO_PAD.encode(bytes)
    }

    #[test]
    fn test_certs_url_derivation() {
        let options = KeyResolverOptions::default();
        assert_eq!(
            certs_url(BASE, &options.certs_path).unwrap(),
            "https://keycloak.example.com/realms/gamify/protocol/openid-connect/certs"
        );
        assert_eq!(
            certs_url("http://localhost:8080/realms/dev/", "protocol/openid-connect/certs")
                .unwrap(),
            "http://localhost:8080/realms/dev/protocol/openid-connect/certs"
        );
    }

    #[test]
    fn test_invalid_issuer_base_urls() {
        for base in [
            "",
            "   ",
            "keycloak.example.com/realms/gamify",
            "ftp://keycloak.example.com",
            "https://keycloak.example.com/realms?x=1",
            "not a url",
        ] {
            let err = certs_url(base, DEFAULT_CERTS_PATH).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidIssuerConfiguration(_)),
                "base: {base:?}"
            );
        }
    }

    #[test]
    fn test_jwks_parsing_skips_unusable_keys() {
        let body = json!({
            "keys": [
                {"kid": "rsa-1", "kty": "RSA", "alg": "RS256", "use": "sig",
                 "n": b64(&[0, 0xAB, 0xCD]), "e": "AQAB"},
                {"kid": "enc-1", "kty": "RSA", "use": "enc", "n": b64(&[1]), "e": "AQAB"},
                {"kid": "hmac", "kty": "oct", "k": "c2VjcmV0"},
                {"kty": "RSA", "n": b64(&[1]), "e": "AQAB"},
                {"kid": "bad-n", "kty": "RSA", "n": "***", "e": "AQAB"},
                {"kid": "ec-1", "kty": "EC", "crv": "P-256",
                 "x": b64(&[1; 32]), "y": b64(&[2; 32])},
                "not-an-object"
            ]
        });

        let key_set = KeySet::from_jwks_json(body.to_string().as_bytes()).unwrap();
        let mut ids: Vec<_> = key_set.key_ids().collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["ec-1", "rsa-1"]);

        let rsa = key_set.get("rsa-1").unwrap();
        assert_eq!(rsa.algorithm(), Some("RS256"));
        assert_eq!(
            rsa.material(),
            &KeyMaterial::Rsa {
                n: vec![0xAB, 0xCD],
                e: vec![1, 0, 1]
            }
        );
        assert_eq!(key_set.get("ec-1").unwrap().material().key_type(), "EC");
    }

    #[test]
    fn test_jwks_parsing_rejects_non_jwks_bodies() {
        for body in [&b"<html>down</html>"[..], br#"{"issuer": "x"}"#, b"[]"] {
            let err = KeySet::from_jwks_json(body).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::KeySourceUnavailable);
        }
    }

    #[test]
    fn test_key_lookup_is_exact() {
        let key_set = KeySet::new([SigningKey::rsa("Key-1", &[1], &[1])]);
        assert!(key_set.get("Key-1").is_some());
        assert!(key_set.get("key-1").is_none());
        assert!(key_set.get("Key-").is_none());
        assert!(key_set.get("").is_none());
    }

    #[tokio::test]
    async fn test_cold_cache_fetches_once() {
        let source = ScriptedSource::new(vec![Ok(vec!["k1"])]);
        let resolver = resolver(Arc::clone(&source), Duration::from_secs(5));

        assert_eq!(resolver.resolve("k1").await.unwrap().kid(), "k1");
        assert_eq!(resolver.resolve("k1").await.unwrap().kid(), "k1");
        assert_eq!(source.fetches(), 1);
    }

    #[tokio::test]
    async fn test_miss_refreshes_exactly_once() {
        let source = ScriptedSource::new(vec![Ok(vec!["k1"]), Ok(vec!["k1", "k2"])]);
        let resolver = resolver(Arc::clone(&source), Duration::ZERO);

        resolver.resolve("k1").await.unwrap();
        assert_eq!(resolver.resolve("k2").await.unwrap().kid(), "k2");
        assert_eq!(resolver.resolve("k2").await.unwrap().kid(), "k2");
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test]
    async fn test_absent_key_after_refresh_is_not_found() {
        let source = ScriptedSource::new(vec![Ok(vec!["k1"]), Ok(vec!["k1"])]);
        let resolver = resolver(Arc::clone(&source), Duration::ZERO);

        resolver.resolve("k1").await.unwrap();
        let err = resolver.resolve("ghost").await.unwrap_err();
        assert_eq!(
            err,
            TokenError::KeyNotFound {
                kid: "ghost".into()
            }
        );
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_limits_refreshes() {
        let source = ScriptedSource::new(vec![Ok(vec!["k1"]), Ok(vec!["k1", "k2"])]);
        let resolver = resolver(Arc::clone(&source), Duration::from_secs(30));

        resolver.resolve("k1").await.unwrap();
        for _ in 0..10 {
            let err = resolver.resolve("k2").await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::KeyNotFound);
        }
        assert_eq!(source.fetches(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(resolver.resolve("k2").await.unwrap().kid(), "k2");
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_on_cold_cache() {
        let source = ScriptedSource::new(vec![Err("connection refused".into())]);
        let resolver = resolver(Arc::clone(&source), Duration::from_secs(30));

        let err = resolver.resolve("k1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeySourceUnavailable);

        // Within the cooldown the last failure is reported without another fetch
        let err = resolver.resolve("k1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeySourceUnavailable);
        assert_eq!(source.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_set_is_refetched() {
        let source = ScriptedSource::new(vec![Ok(vec!["k1"]), Ok(vec!["k2"])]);
        let resolver = resolver(Arc::clone(&source), Duration::from_secs(5));

        resolver.resolve("k1").await.unwrap();
        tokio::time::advance(Duration::from_secs(601)).await;

        // Served from the expired set while the refetch runs
        assert_eq!(resolver.resolve("k1").await.unwrap().kid(), "k1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.fetches(), 2);

        // The refreshed set no longer carries k1
        assert!(resolver.resolve("k2").await.is_ok());
        let err = resolver.resolve("k1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyNotFound);
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_key_served_when_refresh_fails() {
        let source = ScriptedSource::new(vec![Ok(vec!["k1"]), Err("503".into())]);
        let resolver = resolver(Arc::clone(&source), Duration::from_secs(5));

        resolver.resolve("k1").await.unwrap();
        tokio::time::advance(Duration::from_secs(601)).await;

        assert_eq!(resolver.resolve("k1").await.unwrap().kid(), "k1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.fetches(), 2);

        // Within the cooldown the failed refresh is not retried
        for _ in 0..5 {
            assert_eq!(resolver.resolve("k1").await.unwrap().kid(), "k1");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_key_not_blocked_by_slow_refresh() {
        let source = ScriptedSource::with_delay(
            vec![Ok(vec!["k1"]), Ok(vec!["k1"])],
            Duration::from_secs(8),
        );
        let resolver = resolver(Arc::clone(&source), Duration::from_secs(5));

        resolver.resolve("k1").await.unwrap();
        tokio::time::advance(Duration::from_secs(601)).await;

        let first = {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.resolve("k1").await })
        };
        tokio::task::yield_now().await;

        let started = Instant::now();
        assert_eq!(resolver.resolve("k1").await.unwrap().kid(), "k1");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(first.await.unwrap().is_ok());

        // One background refetch, then the set is fresh again
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(source.fetches(), 2);
        let key_set = resolver.cache().get(resolver.certs_url()).unwrap();
        assert!(key_set.age() < Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_coalesce() {
        let source = ScriptedSource::with_delay(vec![Ok(vec!["k1"])], Duration::from_millis(200));
        let resolver = resolver(Arc::clone(&source), Duration::from_secs(5));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let resolver = resolver.clone();
                tokio::spawn(async move { resolver.resolve("k1").await })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().kid(), "k1");
        }
        assert_eq!(source.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_reads_do_not_wait_for_refresh() {
        let source = ScriptedSource::with_delay(
            vec![Ok(vec!["k1"]), Ok(vec!["k1", "k2"])],
            Duration::from_secs(3),
        );
        let resolver = resolver(Arc::clone(&source), Duration::ZERO);
        resolver.resolve("k1").await.unwrap();

        let refreshing = {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.resolve("k2").await })
        };
        tokio::task::yield_now().await;

        let started = Instant::now();
        resolver.resolve("k1").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        assert!(refreshing.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_shared_cache_across_resolvers() {
        let cache = Arc::new(KeySetCache::new());
        let source = ScriptedSource::new(vec![Ok(vec!["k1"])]);

        let first = KeyResolver::with_source(
            BASE,
            KeyResolverOptions::default(),
            Arc::clone(&source) as Arc<dyn KeySource>,
            Arc::clone(&cache),
        )
        .unwrap();
        let second = KeyResolver::with_source(
            &format!("{BASE}/"),
            KeyResolverOptions::default(),
            Arc::clone(&source) as Arc<dyn KeySource>,
            Arc::clone(&cache),
        )
        .unwrap();

        first.resolve("k1").await.unwrap();
        second.resolve("k1").await.unwrap();
        assert_eq!(source.fetches(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_prefetch_and_invalidate() {
        let source = ScriptedSource::new(vec![Ok(vec!["k1", "k2"]), Ok(vec!["k1"])]);
        let resolver = resolver(Arc::clone(&source), Duration::ZERO);

        assert_eq!(resolver.prefetch().await.unwrap(), 2);
        assert!(resolver.cache().get(resolver.certs_url()).is_some());

        resolver.invalidate();
        assert!(resolver.cache().get(resolver.certs_url()).is_none());

        resolver.resolve("k1").await.unwrap();
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_refetches_within_cooldown() {
        let source = ScriptedSource::new(vec![Ok(vec!["k1"]), Ok(vec!["k1"])]);
        let resolver = resolver(Arc::clone(&source), Duration::from_secs(5));

        resolver.prefetch().await.unwrap();
        resolver.invalidate();

        assert_eq!(resolver.resolve("k1").await.unwrap().kid(), "k1");
        assert_eq!(source.fetches(), 2);

        // The fetch after invalidation restarts the cooldown
        let err = resolver.resolve("k2").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeyNotFound);
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test]
    async fn test_inserted_set_is_served_without_fetching() {
        let source = ScriptedSource::new(vec![]);
        let resolver = resolver(Arc::clone(&source), Duration::from_secs(5));

        resolver.cache().insert(
            resolver.certs_url(),
            KeySet::new([SigningKey::rsa("seeded", &[0xC5; 256], &[1, 0, 1])]),
        );

        assert_eq!(resolver.resolve("seeded").await.unwrap().kid(), "seeded");
        assert_eq!(source.fetches(), 0);
    }
}
