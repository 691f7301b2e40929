//! Error types for token validation
//!
//! Two separate error types exist on purpose:
//!
//! - [`TokenError`] is returned per request. Every variant is a distinct, inspectable kind so the
//!   calling layer can tell a malformed request from an unauthenticated or unauthorized one.
//! - [`ConfigError`] is returned once, when a validator or key resolver is constructed.

use http::StatusCode;
use std::fmt;
use thiserror::Error;

/// Per-request token validation failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// Token string is structurally invalid (segments, base64url, JSON)
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// Key ID is absent from the issuer's published key set, even after a refresh
    #[error("Signing key not found: {kid}")]
    KeyNotFound {
        /// The key ID requested by the token header (empty when the header had none)
        kid: String,
    },

    /// The issuer's key set could not be fetched or parsed
    #[error("Key set unavailable: {0}")]
    KeySourceUnavailable(String),

    /// Recomputed signature does not match, or the algorithm/key is not acceptable
    #[error("Invalid signature: {0}")]
    SignatureInvalid(String),

    /// Token issuer is not one of the trusted issuers
    #[error("Unknown issuer: {}", .found.as_deref().unwrap_or("<none>"))]
    IssuerMismatch {
        /// The `iss` claim carried by the token, if any
        found: Option<String>,
    },

    /// Token is at or past its expiry (plus configured leeway)
    #[error("Token expired at {expired_at}")]
    TokenExpired {
        /// The `exp` claim (seconds since the Unix epoch)
        expired_at: u64,
    },

    /// Token carries no subject
    #[error("Token has no subject")]
    MissingSubject,

    /// Caller lacks at least one required role
    #[error("Missing required roles: {}", .missing.join(", "))]
    InsufficientRole {
        /// Required roles the token does not carry, sorted
        missing: Vec<String>,
    },
}

/// Discriminant of a [`TokenError`], for matching and metrics labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`TokenError::MalformedToken`]
    MalformedToken,
    /// See [`TokenError::KeyNotFound`]
    KeyNotFound,
    /// See [`TokenError::KeySourceUnavailable`]
    KeySourceUnavailable,
    /// See [`TokenError::SignatureInvalid`]
    SignatureInvalid,
    /// See [`TokenError::IssuerMismatch`]
    IssuerMismatch,
    /// See [`TokenError::TokenExpired`]
    TokenExpired,
    /// See [`TokenError::MissingSubject`]
    MissingSubject,
    /// See [`TokenError::InsufficientRole`]
    InsufficientRole,
}

impl ErrorKind {
    /// Stable snake_case name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedToken => "malformed_token",
            Self::KeyNotFound => "key_not_found",
            Self::KeySourceUnavailable => "key_source_unavailable",
            Self::SignatureInvalid => "signature_invalid",
            Self::IssuerMismatch => "issuer_mismatch",
            Self::TokenExpired => "token_expired",
            Self::MissingSubject => "missing_subject",
            Self::InsufficientRole => "insufficient_role",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TokenError {
    /// Create a malformed token error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedToken(reason.into())
    }

    /// Create an invalid signature error
    pub fn signature(reason: impl Into<String>) -> Self {
        Self::SignatureInvalid(reason.into())
    }

    /// Create a key source error
    pub fn key_source(reason: impl Into<String>) -> Self {
        Self::KeySourceUnavailable(reason.into())
    }

    /// The kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedToken(_) => ErrorKind::MalformedToken,
            Self::KeyNotFound { .. } => ErrorKind::KeyNotFound,
            Self::KeySourceUnavailable(_) => ErrorKind::KeySourceUnavailable,
            Self::SignatureInvalid(_) => ErrorKind::SignatureInvalid,
            Self::IssuerMismatch { .. } => ErrorKind::IssuerMismatch,
            Self::TokenExpired { .. } => ErrorKind::TokenExpired,
            Self::MissingSubject => ErrorKind::MissingSubject,
            Self::InsufficientRole { .. } => ErrorKind::InsufficientRole,
        }
    }

    /// Conventional HTTP status for this failure
    ///
    /// Malformed tokens are the client's fault (400), an unreachable key source is ours (503),
    /// and every trust or permission failure is 401. Callers are free to map differently.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedToken(_) => StatusCode::BAD_REQUEST,
            Self::KeySourceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

/// Construction-time configuration failure
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Issuer or issuer base URL is missing or invalid
    #[error("Invalid issuer configuration: {0}")]
    InvalidIssuerConfiguration(String),

    /// Config file not found
    #[error("Configuration file not found: {0}")]
    FileNotFound(std::path::PathBuf),

    /// Unsupported file format
    #[error("Unsupported configuration file format. Use .toml, .yaml, .yml, or .json")]
    UnsupportedFormat,

    /// Configuration parsing error
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] ::config::ConfigError),

    /// HTTP client could not be built
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),
}

impl ConfigError {
    /// Create an invalid issuer configuration error
    pub fn invalid_issuer(reason: impl Into<String>) -> Self {
        Self::InvalidIssuerConfiguration(reason.into())
    }
}
