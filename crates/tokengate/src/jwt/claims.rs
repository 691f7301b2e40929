//! Claim validation and role extraction
//!
//! Checks run in a fixed order so the reported failure is deterministic: issuer, then expiry,
//! then subject. Roles are read from Keycloak's `realm_access.roles`; a missing or malformed
//! role claim is an empty role set, never an error, so that authorization (not decoding) is
//! what reports a missing role.

use super::TokenClaims;
use super::decoder::DecodedToken;
use crate::error::TokenError;
use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Claims relevant to authorization, taken from a validated token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationClaims {
    /// Subject (user ID)
    pub subject: String,
    /// Realm roles
    pub roles: BTreeSet<String>,
    /// Issuer the token was accepted from
    pub issuer: String,
    /// Expiry (seconds since the Unix epoch)
    pub expires_at: u64,
    /// Client the token was issued to (azp), if present
    pub authorized_party: Option<String>,
}

impl AuthorizationClaims {
    /// Check if the caller has a role (case-sensitive)
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Expiry as a `SystemTime`
    pub fn expires_at_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.expires_at)
    }
}

/// Extract `realm_access.roles`, ignoring anything that is not a list of strings
pub fn realm_roles(claims: &TokenClaims) -> BTreeSet<String> {
    let Some(roles) = claims
        .additional
        .get("realm_access")
        .and_then(|realm_access| realm_access.get("roles"))
        .and_then(serde_json::Value::as_array)
    else {
        debug!("Token carries no realm_access.roles, using empty role set");
        return BTreeSet::new();
    };

    roles
        .iter()
        .filter_map(serde_json::Value::as_str)
        .map(str::to_string)
        .collect()
}

/// Validates issuer, expiry and subject
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use tokengate::jwt::ClaimsValidator;
///
/// let validator = ClaimsValidator::new("https://keycloak.example.com/realms/gamify")
///     .with_leeway(Duration::from_secs(5));
/// assert_eq!(validator.leeway(), Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct ClaimsValidator {
    trusted_issuers: BTreeSet<String>,
    leeway: Duration,
}

impl ClaimsValidator {
    /// Validator trusting exactly one issuer, with no leeway
    pub fn new(trusted_issuer: impl Into<String>) -> Self {
        Self::with_trusted_issuers([trusted_issuer.into()])
    }

    /// Validator trusting a set of issuers; empty names are ignored
    pub fn with_trusted_issuers<I, S>(issuers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            trusted_issuers: issuers
                .into_iter()
                .map(Into::into)
                .filter(|issuer: &String| !issuer.is_empty())
                .collect(),
            leeway: Duration::ZERO,
        }
    }

    /// Trust one more issuer
    pub fn add_trusted_issuer(mut self, issuer: impl Into<String>) -> Self {
        let issuer = issuer.into();
        if !issuer.is_empty() {
            self.trusted_issuers.insert(issuer);
        }
        self
    }

    /// Accept tokens up to `leeway` past their expiry
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    /// Trusted issuers, sorted
    pub fn trusted_issuers(&self) -> impl Iterator<Item = &str> {
        self.trusted_issuers.iter().map(String::as_str)
    }

    /// Configured leeway
    pub fn leeway(&self) -> Duration {
        self.leeway
    }

    /// Validate against the current time
    ///
    /// # Errors
    ///
    /// See [`ClaimsValidator::validate_at`].
    pub fn validate(&self, decoded: &DecodedToken) -> Result<AuthorizationClaims, TokenError> {
        self.validate_at(decoded, SystemTime::now())
    }

    /// Validate against an explicit clock
    ///
    /// # Errors
    ///
    /// In this order: [`TokenError::IssuerMismatch`] if `iss` is missing or untrusted,
    /// [`TokenError::MalformedToken`] if `exp` is missing, [`TokenError::TokenExpired`] if
    /// `now` is at or past `exp + leeway`, [`TokenError::MissingSubject`] if `sub` is missing
    /// or empty.
    pub fn validate_at(
        &self,
        decoded: &DecodedToken,
        now: SystemTime,
    ) -> Result<AuthorizationClaims, TokenError> {
        let claims = decoded.claims();

        let issuer = match claims.iss.as_deref() {
            Some(issuer) if self.trusted_issuers.contains(issuer) => issuer,
            other => {
                warn!(issuer = ?other, "Access denied: unknown issuer");
                return Err(TokenError::IssuerMismatch {
                    found: other.map(str::to_string),
                });
            }
        };

        let expires_at = claims
            .exp
            .ok_or_else(|| TokenError::malformed("token has no exp claim"))?;
        let now_secs = now
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        if now_secs >= expires_at.saturating_add(self.leeway.as_secs()) {
            debug!(expired_at = expires_at, now = now_secs, "Access denied: token expired");
            return Err(TokenError::TokenExpired {
                expired_at: expires_at,
            });
        }

        let subject = claims
            .sub
            .as_deref()
            .filter(|subject| !subject.is_empty())
            .ok_or(TokenError::MissingSubject)?;

        Ok(AuthorizationClaims {
            subject: subject.to_string(),
            roles: realm_roles(claims),
            issuer: issuer.to_string(),
            expires_at,
            authorized_party: claims.azp.clone(),
        })
    }
}
