//! # tokengate - Bearer Token Validation for Keycloak Realms
//!
//! Validates RS256-signed access tokens issued by a Keycloak-style authorization server and
//! checks realm roles before a request reaches business logic.
//!
//! ## Key Features
//!
//! - **Fail-closed signatures** - algorithm allowlist, `alg: none` never accepted
//! - **JWKS caching** - lock-free reads, refresh on unknown key ID, rate-limited and coalesced
//! - **Typed failures** - every rejection is a distinct [`TokenError`] variant
//! - **Realm roles** - `realm_access.roles` checked against the required set
//!
//! ## Architecture
//!
//! - [`jwt`] - decoding, key resolution, signature and claim checks
//! - [`authorizer`] - required-role check
//! - [`validator`] - the [`TokenValidator`] facade running the whole pipeline
//! - [`config`] - [`ValidatorConfig`], loaded from files and `KEYCLOAK__*` variables
//! - [`error`] - [`TokenError`] (per request) and [`ConfigError`] (at startup)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tokengate::{ErrorKind, TokenValidator, ValidatorConfig};
//!
//! # async fn run(bearer: &str) -> Result<(), Box<dyn std::error::Error>> {
//! let validator = TokenValidator::new(ValidatorConfig::new(
//!     "https://keycloak.example.com/realms/gamify",
//!     "https://keycloak.example.com/realms/gamify",
//! ))?;
//!
//! match validator.validate_and_authorize(bearer, ["lecturer"]).await {
//!     Ok(claims) => println!("welcome {}", claims.subject),
//!     Err(e) if e.kind() == ErrorKind::InsufficientRole => println!("forbidden: {e}"),
//!     Err(e) => println!("rejected with {}: {e}", e.status_code()),
//! }
//! # Ok(())
//! # }
//! ```

pub mod authorizer;
pub mod config;
pub mod error;
pub mod jwt;
pub mod validator;

#[doc(inline)]
pub use crate::authorizer::authorize;
#[doc(inline)]
pub use crate::config::ValidatorConfig;
#[doc(inline)]
pub use crate::error::{ConfigError, ErrorKind, TokenError};
#[doc(inline)]
pub use crate::jwt::{AuthorizationClaims, DecodedToken, KeyResolver, KeySetCache, KeySource};
#[doc(inline)]
pub use crate::validator::TokenValidator;
