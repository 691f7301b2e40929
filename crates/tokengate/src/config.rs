//! Validator configuration
//!
//! Holds the trusted issuer, the issuer base URL the key set is discovered under, and the key
//! cache tuning. Loaded from a file plus `KEYCLOAK__*` environment overrides, or built in code.
//!
//! ```toml
//! issuer = "https://keycloak.example.com/realms/gamify"
//! url = "https://keycloak.example.com/realms/gamify"
//! leeway_secs = 5
//! refresh_cooldown_secs = 5
//! ```

use crate::error::ConfigError;
use crate::jwt::jwks::{DEFAULT_CERTS_PATH, KeyResolverOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default environment variable prefix (`KEYCLOAK__ISSUER`, `KEYCLOAK__URL`, ...)
pub const DEFAULT_ENV_PREFIX: &str = "KEYCLOAK";

/// Token validator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Expected `iss` claim, compared exactly
    pub issuer: String,

    /// Further issuers to trust (e.g. the same realm behind a second hostname)
    #[serde(default)]
    pub additional_issuers: Vec<String>,

    /// Issuer base URL; the key set is fetched from `{url}{certs_path}`
    pub url: String,

    /// Clock skew tolerated past `exp`, in seconds
    #[serde(default)]
    pub leeway_secs: u64,

    /// Minimum seconds between two key set fetches (0 disables rate limiting)
    #[serde(default = "default_refresh_cooldown_secs")]
    pub refresh_cooldown_secs: u64,

    /// Seconds after which a cached key set is refetched
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Key set fetch timeout in seconds
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Key discovery path below `url`
    #[serde(default = "default_certs_path")]
    pub certs_path: String,
}

fn default_refresh_cooldown_secs() -> u64 {
    5
}

fn default_cache_ttl_secs() -> u64 {
    600
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

fn default_certs_path() -> String {
    DEFAULT_CERTS_PATH.to_string()
}

impl ValidatorConfig {
    /// Configuration with defaults for everything but the issuer and base URL
    pub fn new(issuer: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            additional_issuers: Vec::new(),
            url: url.into(),
            leeway_secs: 0,
            refresh_cooldown_secs: default_refresh_cooldown_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            certs_path: default_certs_path(),
        }
    }

    /// Trust an additional issuer
    pub fn with_additional_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.additional_issuers.push(issuer.into());
        self
    }

    /// Set the expiry leeway
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway_secs = leeway.as_secs();
        self
    }

    /// Set the minimum interval between key set fetches
    pub fn with_refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.refresh_cooldown_secs = cooldown.as_secs();
        self
    }

    /// Set the key set cache TTL
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_secs = ttl.as_secs();
        self
    }

    /// Set the key set fetch timeout
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the key discovery path
    pub fn with_certs_path(mut self, path: impl Into<String>) -> Self {
        self.certs_path = path.into();
        self
    }

    /// Expiry leeway
    pub fn leeway(&self) -> Duration {
        Duration::from_secs(self.leeway_secs)
    }

    /// Every trusted issuer, primary first
    pub fn trusted_issuers(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.issuer.as_str())
            .chain(self.additional_issuers.iter().map(String::as_str))
    }

    /// Key resolver options derived from this configuration
    pub fn resolver_options(&self) -> KeyResolverOptions {
        KeyResolverOptions {
            certs_path: self.certs_path.clone(),
            refresh_cooldown: Duration::from_secs(self.refresh_cooldown_secs),
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
        }
    }

    /// Startup checks
    ///
    /// The base URL itself is parsed when the key resolver is built.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidIssuerConfiguration`] if the issuer or base URL is blank,
    /// the fetch timeout is zero, or the cache TTL is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.issuer.trim().is_empty() {
            return Err(ConfigError::invalid_issuer("issuer is empty"));
        }
        if self.url.trim().is_empty() {
            return Err(ConfigError::invalid_issuer("keycloak URL is empty"));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::invalid_issuer("fetch timeout must be positive"));
        }
        if self.cache_ttl_secs == 0 {
            return Err(ConfigError::invalid_issuer("cache TTL must be positive"));
        }
        Ok(())
    }

    /// Load configuration from a file (TOML, YAML, or JSON)
    ///
    /// The format is picked from the extension. Environment variables with the `KEYCLOAK__`
    /// prefix override file settings, e.g. `KEYCLOAK__ISSUER`.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use tokengate::ValidatorConfig;
    ///
    /// let config = ValidatorConfig::from_file("keycloak.toml").expect("Failed to load config");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error if the file doesn't exist, has an unsupported extension, or does not
    /// deserialize. The result is not [validated](Self::validate).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_prefix(path, DEFAULT_ENV_PREFIX)
    }

    /// Load configuration from a file with a custom environment prefix
    ///
    /// # Errors
    ///
    /// See [`ValidatorConfig::from_file`].
    pub fn from_file_with_prefix(
        path: impl AsRef<Path>,
        env_prefix: &str,
    ) -> Result<Self, ConfigError> {
        use ::config::{Config, Environment, File, FileFormat};

        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let format = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => FileFormat::Toml,
            Some("yaml" | "yml") => FileFormat::Yaml,
            Some("json") => FileFormat::Json,
            _ => return Err(ConfigError::UnsupportedFormat),
        };

        let config = Config::builder()
            .add_source(File::new(
                path.to_str().ok_or(ConfigError::UnsupportedFormat)?,
                format,
            ))
            .add_source(
                Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
