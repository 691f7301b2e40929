//! Signature verification with an explicit algorithm allowlist
//!
//! The token header's `alg` only *selects* among registered schemes; it can never introduce
//! behaviour that was not registered. `none` is refused in every spelling, even if someone
//! registers a scheme under that name.

use super::decoder::DecodedToken;
use super::jwks::{KeyMaterial, SigningKey};
use crate::error::TokenError;
use ring::signature as ring_signature;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// A signature algorithm that can check a token signature with a public key
pub trait SignatureScheme: Send + Sync + fmt::Debug {
    /// JOSE algorithm name as it appears in the token header, e.g. `RS256`
    fn name(&self) -> &'static str;

    /// Verify `signature` over `message` with `key`
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::SignatureInvalid`] if the key has the wrong type or the signature
    /// does not match.
    fn verify(&self, message: &[u8], signature: &[u8], key: &SigningKey) -> Result<(), TokenError>;
}

/// RSASSA-PKCS1-v1_5 with SHA-256, 2048 to 8192 bit moduli
#[derive(Debug, Clone, Copy, Default)]
pub struct Rs256;

impl SignatureScheme for Rs256 {
    fn name(&self) -> &'static str {
        "RS256"
    }

    fn verify(&self, message: &[u8], signature: &[u8], key: &SigningKey) -> Result<(), TokenError> {
        let KeyMaterial::Rsa { n, e } = key.material() else {
            return Err(TokenError::signature(format!(
                "RS256 requires an RSA key, key '{}' is {}",
                key.kid(),
                key.material().key_type()
            )));
        };

        ring_signature::RsaPublicKeyComponents { n, e }
            .verify(
                &ring_signature::RSA_PKCS1_2048_8192_SHA256,
                message,
                signature,
            )
            .map_err(|_| TokenError::signature("signature does not match"))
    }
}

/// Registry of allowed signature schemes
///
/// # Example
///
/// ```rust
/// use tokengate::jwt::SignatureVerifier;
///
/// let verifier = SignatureVerifier::new();
/// assert!(verifier.scheme_for("RS256").is_ok());
/// assert!(verifier.scheme_for("none").is_err());
/// assert!(verifier.scheme_for("HS256").is_err());
/// ```
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    schemes: BTreeMap<&'static str, Arc<dyn SignatureScheme>>,
}

impl Default for SignatureVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SignatureVerifier {
    /// Verifier accepting RS256 only
    pub fn new() -> Self {
        Self::empty().with_scheme(Rs256)
    }

    /// Verifier accepting nothing
    pub fn empty() -> Self {
        Self {
            schemes: BTreeMap::new(),
        }
    }

    /// Allow an additional scheme, replacing any scheme with the same name
    pub fn with_scheme(mut self, scheme: impl SignatureScheme + 'static) -> Self {
        let name = scheme.name();
        if is_unsigned(name) {
            warn!(algorithm = name, "Refusing to register unsigned algorithm");
            return self;
        }
        self.schemes.insert(name, Arc::new(scheme));
        self
    }

    /// Allowed algorithm names, sorted
    pub fn algorithms(&self) -> Vec<&'static str> {
        self.schemes.keys().copied().collect()
    }

    /// Look up the scheme for a header `alg` value
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::SignatureInvalid`] for `none` and for any algorithm that is not
    /// registered. Names are matched case-sensitively.
    pub fn scheme_for(&self, alg: &str) -> Result<&dyn SignatureScheme, TokenError> {
        if is_unsigned(alg) {
            warn!("Rejecting unsigned token (alg=none)");
            return Err(TokenError::signature("unsigned tokens are not accepted"));
        }

        self.schemes.get(alg).map(|scheme| scheme.as_ref()).ok_or_else(|| {
            warn!(
                algorithm = alg,
                allowed = ?self.algorithms(),
                "JWT algorithm not allowed"
            );
            TokenError::signature(format!("algorithm '{alg}' is not allowed"))
        })
    }

    /// Verify the token signature over its original `header.payload` span
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::SignatureInvalid`] if the algorithm is not allowed, the key is
    /// restricted to another algorithm or has the wrong type, or the signature does not match.
    pub fn verify(&self, decoded: &DecodedToken, key: &SigningKey) -> Result<(), TokenError> {
        let scheme = self.scheme_for(decoded.algorithm())?;

        if let Some(key_alg) = key.algorithm()
            && key_alg != scheme.name()
        {
            warn!(
                key_id = key.kid(),
                key_algorithm = key_alg,
                token_algorithm = scheme.name(),
                "Key is not published for the token algorithm"
            );
            return Err(TokenError::signature(format!(
                "key '{}' is for {key_alg}, token uses {}",
                key.kid(),
                scheme.name()
            )));
        }

        scheme
            .verify(decoded.signing_input(), decoded.signature(), key)
            .inspect_err(|e| warn!(key_id = key.kid(), error = %e, "JWT signature rejected"))?;

        debug!(key_id = key.kid(), algorithm = scheme.name(), "JWT signature verified");
        Ok(())
    }
}

fn is_unsigned(alg: &str) -> bool {
    alg.trim().eq_ignore_ascii_case("none")
}
