//! Realm-role authorization
//!
//! Roles are flat, case-sensitive names. There is no hierarchy: `admin` does not imply
//! `lecturer`.

use crate::error::TokenError;
use crate::jwt::AuthorizationClaims;
use std::collections::BTreeSet;
use tracing::info;

/// Check that the caller carries every required role
///
/// An empty `required` set always succeeds.
///
/// # Errors
///
/// Returns [`TokenError::InsufficientRole`] listing the missing roles, sorted.
///
/// # Example
///
/// ```rust
/// use std::collections::BTreeSet;
/// use tokengate::authorizer::authorize;
/// use tokengate::jwt::AuthorizationClaims;
///
/// let claims = AuthorizationClaims {
///     subject: "user-1".into(),
///     roles: BTreeSet::from(["student".to_string()]),
///     issuer: "https://keycloak.example.com/realms/gamify".into(),
///     expires_at: 4_102_444_800,
///     authorized_party: None,
/// };
///
/// assert!(authorize(&claims, ["student"]).is_ok());
/// assert!(authorize(&claims, ["lecturer"]).is_err());
/// assert!(authorize(&claims, Vec::<String>::new()).is_ok());
/// ```
pub fn authorize<I, S>(claims: &AuthorizationClaims, required: I) -> Result<(), TokenError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let missing: BTreeSet<String> = required
        .into_iter()
        .filter(|role| !claims.roles.contains(role.as_ref()))
        .map(|role| role.as_ref().to_string())
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    let missing: Vec<String> = missing.into_iter().collect();
    info!(
        subject = %claims.subject,
        missing_roles = ?missing,
        "Access denied: user has not all required roles"
    );
    Err(TokenError::InsufficientRole { missing })
}
