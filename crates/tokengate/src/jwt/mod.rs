//! JWT infrastructure - decoding, key resolution, signature and claim checks
//!
//! # Architecture
//!
//! ```text
//!            raw token
//!                │
//!        ┌───────▼────────┐
//!        │    decoder     │  split + base64url, no trust decisions
//!        └───────┬────────┘
//!                │ DecodedToken
//!        ┌───────▼────────┐     ┌────────────────┐
//!        │   signature    │◄────│      jwks      │  cached issuer keys
//!        └───────┬────────┘     └────────────────┘
//!                │
//!        ┌───────▼────────┐
//!        │     claims     │  issuer, expiry, subject, realm roles
//!        └────────────────┘
//! ```
//!
//! # Modules
//!
//! - `decoder` - compact serialization parsing
//! - `jwks` - JWKS fetching and caching
//! - `signature` - allowlisted signature schemes
//! - `claims` - issuer/expiry validation and role extraction

pub mod claims;
pub mod decoder;
pub mod jwks;
pub mod signature;

pub use claims::{AuthorizationClaims, ClaimsValidator};
pub use decoder::{DecodedToken, decode};
pub use jwks::{
    HttpKeySource, KeyMaterial, KeyResolver, KeyResolverOptions, KeySet, KeySetCache, KeySource,
    SigningKey,
};
pub use signature::{Rs256, SignatureScheme, SignatureVerifier};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// JOSE header of a token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenHeader {
    /// Algorithm (alg) - selects the signature scheme
    pub alg: String,

    /// Key ID (kid) - selects the key within the issuer's key set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    /// Media type (typ), usually "JWT"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,

    /// Any other header parameters
    #[serde(flatten)]
    pub additional: HashMap<String, serde_json::Value>,
}

/// Token payload: registered claims per RFC 7519 plus everything else
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TokenClaims {
    /// Issuer (iss) - identifies who issued the token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    /// Subject (sub) - identifies the principal (user ID)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    /// Audience (aud) - a string or an array of strings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<serde_json::Value>,

    /// Expiration Time (exp) - Unix timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,

    /// Not Before (nbf) - Unix timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,

    /// Issued At (iat) - Unix timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,

    /// JWT ID (jti)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,

    /// Authorized party (azp) - the client the token was issued to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,

    /// Custom claims, e.g. `realm_access`
    #[serde(flatten)]
    pub additional: HashMap<String, serde_json::Value>,
}
