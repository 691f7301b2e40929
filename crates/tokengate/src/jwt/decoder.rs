//! Compact JWT decoding
//!
//! Splits `header.payload.signature`, base64url-decodes each segment and parses the header and
//! payload as JSON objects. Nothing here is trusted: a forged token decodes just as well as a
//! genuine one. The original encoded `header.payload` span is kept so the signature can be
//! checked against exactly the bytes the issuer signed.

use super::{TokenClaims, TokenHeader};
use crate::error::TokenError;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::de::DeserializeOwned;

/// Structured, unverified view of a raw token
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedToken {
    header: TokenHeader,
    claims: TokenClaims,
    signature: Vec<u8>,
    raw: String,
    signing_input_len: usize,
}

impl DecodedToken {
    /// The JOSE header
    pub fn header(&self) -> &TokenHeader {
        &self.header
    }

    /// The payload claims
    pub fn claims(&self) -> &TokenClaims {
        &self.claims
    }

    /// Decoded signature bytes
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// `<header segment>.<payload segment>` exactly as received
    pub fn signing_input(&self) -> &[u8] {
        &self.raw.as_bytes()[..self.signing_input_len]
    }

    /// The raw compact token this view was decoded from
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Header algorithm name
    pub fn algorithm(&self) -> &str {
        &self.header.alg
    }

    /// Header key ID
    pub fn key_id(&self) -> Option<&str> {
        self.header.kid.as_deref()
    }

    /// Issuer claim
    pub fn issuer(&self) -> Option<&str> {
        self.claims.iss.as_deref()
    }

    /// Subject claim
    pub fn subject(&self) -> Option<&str> {
        self.claims.sub.as_deref()
    }

    /// Expiry claim (seconds since the Unix epoch)
    pub fn expires_at(&self) -> Option<u64> {
        self.claims.exp
    }
}

/// Decode a compact JWT without verifying it
///
/// # Errors
///
/// Returns [`TokenError::MalformedToken`] if the token is blank, does not have exactly three
/// segments, a segment is not unpadded base64url, or the header/payload is not a JSON object
/// with correctly typed registered fields.
pub fn decode(raw: &str) -> Result<DecodedToken, TokenError> {
    if raw.trim().is_empty() {
        return Err(TokenError::malformed("token is empty"));
    }

    let mut segments = raw.split('.');
    let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(TokenError::malformed(
            "expected three dot-separated segments",
        ));
    };

    let header: TokenHeader = decode_json_segment(header_b64, "header")?;
    let claims: TokenClaims = decode_json_segment(payload_b64, "payload")?;

    // Empty is fine here: an unsigned token is rejected by the signature step, not the decoder
    let signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|e| TokenError::malformed(format!("signature is not base64url: {e}")))?;

    Ok(DecodedToken {
        header,
        claims,
        signature,
        raw: raw.to_owned(),
        signing_input_len: header_b64.len() + 1 + payload_b64.len(),
    })
}

fn decode_json_segment<T: DeserializeOwned>(segment: &str, name: &str) -> Result<T, TokenError> {
    if segment.is_empty() {
        return Err(TokenError::malformed(format!("{name} segment is empty")));
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| TokenError::malformed(format!("{name} is not base64url: {e}")))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| TokenError::malformed(format!("{name} is not a valid JSON object: {e}")))
}
