//! Token validation facade
//!
//! [`TokenValidator`] wires the pipeline together and short-circuits on the first failure:
//!
//! 1. decode the compact token
//! 2. look up the signature scheme for the header `alg` (before any key fetch)
//! 3. resolve the signing key by header `kid`
//! 4. verify the signature over the original `header.payload` span
//! 5. check issuer, expiry and subject
//! 6. check the required realm roles

use crate::authorizer::authorize;
use crate::config::ValidatorConfig;
use crate::error::{ConfigError, TokenError};
use crate::jwt::{
    AuthorizationClaims, ClaimsValidator, DecodedToken, HttpKeySource, KeyResolver, KeySetCache,
    KeySource, SignatureVerifier, decode,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Validates bearer tokens from one Keycloak realm
///
/// Construct once at startup and share (it is `Clone`, `Send` and `Sync`).
///
/// # Example
///
/// ```rust,no_run
/// use tokengate::{TokenValidator, ValidatorConfig};
///
/// # async fn handle(bearer: &str) -> Result<(), Box<dyn std::error::Error>> {
/// let config = ValidatorConfig::new(
///     "https://keycloak.example.com/realms/gamify",
///     "https://keycloak.example.com/realms/gamify",
/// );
/// let validator = TokenValidator::new(config)?;
///
/// let claims = validator.validate_and_authorize(bearer, ["lecturer"]).await?;
/// println!("lecturer {} authorized", claims.subject);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TokenValidator {
    claims: ClaimsValidator,
    resolver: KeyResolver,
    verifier: SignatureVerifier,
}

impl TokenValidator {
    /// Create a validator fetching keys over HTTP
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidIssuerConfiguration`] if the issuer or base URL is
    /// missing or invalid, or [`ConfigError::HttpClient`] if the HTTP client cannot be built.
    pub fn new(config: ValidatorConfig) -> Result<Self, ConfigError> {
        let source = HttpKeySource::new(config.resolver_options().fetch_timeout)?;
        Self::with_key_source(config, Arc::new(source), Arc::new(KeySetCache::new()))
    }

    /// Create a validator with an injected key source and cache
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidIssuerConfiguration`] if the configuration is invalid.
    pub fn with_key_source(
        config: ValidatorConfig,
        source: Arc<dyn KeySource>,
        cache: Arc<KeySetCache>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let resolver =
            KeyResolver::with_source(&config.url, config.resolver_options(), source, cache)?;
        let claims = ClaimsValidator::with_trusted_issuers(config.trusted_issuers())
            .with_leeway(config.leeway());

        info!(
            issuers = ?claims.trusted_issuers().collect::<Vec<_>>(),
            jwks_uri = %resolver.certs_url(),
            "Token validator configured"
        );

        Ok(Self {
            claims,
            resolver,
            verifier: SignatureVerifier::new(),
        })
    }

    /// Replace the signature verifier (e.g. to allow more algorithms)
    pub fn with_verifier(mut self, verifier: SignatureVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    /// The key resolver
    pub fn resolver(&self) -> &KeyResolver {
        &self.resolver
    }

    /// The claims validator
    pub fn claims_validator(&self) -> &ClaimsValidator {
        &self.claims
    }

    /// The signature verifier
    pub fn verifier(&self) -> &SignatureVerifier {
        &self.verifier
    }

    /// Fetch the issuer's key set now, returning the number of usable keys
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::KeySourceUnavailable`] if the fetch fails.
    pub async fn prefetch_keys(&self) -> Result<usize, TokenError> {
        self.resolver.prefetch().await
    }

    /// Authenticate a token and check that it carries every required role
    ///
    /// # Errors
    ///
    /// Returns the first failure of the pipeline: [`TokenError::MalformedToken`],
    /// [`TokenError::SignatureInvalid`] (algorithm not allowed, or bad signature),
    /// [`TokenError::KeyNotFound`], [`TokenError::KeySourceUnavailable`],
    /// [`TokenError::IssuerMismatch`], [`TokenError::TokenExpired`],
    /// [`TokenError::MissingSubject`] or [`TokenError::InsufficientRole`].
    pub async fn validate_and_authorize<I, S>(
        &self,
        raw: &str,
        required_roles: I,
    ) -> Result<AuthorizationClaims, TokenError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let claims = self.validate(raw).await?;
        authorize(&claims, required_roles)?;
        Ok(claims)
    }

    /// Authenticate a token without role requirements
    ///
    /// # Errors
    ///
    /// See [`TokenValidator::validate_and_authorize`], minus `InsufficientRole`.
    pub async fn validate(&self, raw: &str) -> Result<AuthorizationClaims, TokenError> {
        let decoded = decode(raw)?;
        self.authenticate(&decoded)
            .await
            .inspect_err(|e| debug!(kind = %e.kind(), error = %e, "Token rejected"))
    }

    async fn authenticate(
        &self,
        decoded: &DecodedToken,
    ) -> Result<AuthorizationClaims, TokenError> {
        // Unsigned and unlisted algorithms fail here, before any key is fetched
        self.verifier.scheme_for(decoded.algorithm())?;

        let Some(kid) = decoded.key_id() else {
            warn!("Token header has no key ID");
            return Err(TokenError::KeyNotFound { kid: String::new() });
        };

        let key = self.resolver.resolve(kid).await?;
        self.verifier.verify(decoded, &key)?;
        self.claims.validate(decoded)
    }

    /// Subject (user ID) of a validated token
    ///
    /// # Errors
    ///
    /// See [`TokenValidator::validate`].
    pub async fn extract_user_id(&self, raw: &str) -> Result<String, TokenError> {
        self.validate(raw).await.map(|claims| claims.subject)
    }

    /// Check that a validated token carries every role in `roles`
    ///
    /// # Errors
    ///
    /// See [`TokenValidator::validate_and_authorize`].
    pub async fn has_roles<I, S>(&self, raw: &str, roles: I) -> Result<(), TokenError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.validate_and_authorize(raw, roles).await.map(|_| ())
    }
}
