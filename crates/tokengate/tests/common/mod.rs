//! Common test utilities for integration tests
//!
//! Provides a mock Keycloak realm serving a JWKS document, fixture RSA keys and a
//! reference encoder (jsonwebtoken) for minting RS256 tokens.

#![allow(dead_code)]

use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokengate::{KeySetCache, TokenValidator, ValidatorConfig};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

/// Realm served by [`MockKeycloak`]
pub const REALM: &str = "gamify";

/// JWK public exponent of both fixture keys (65537)
pub const FIXTURE_E: &str = "AQAB";

/// A fixture RSA key pair with its published modulus
#[derive(Debug, Clone, Copy)]
pub struct FixtureKey {
    pub private_pem: &'static str,
    pub n: &'static str,
}

/// Key published before rotation
pub const PRIMARY: FixtureKey = FixtureKey {
    private_pem: include_str!("../fixtures/primary_rsa.pem"),
    n: "liZa1HZCJMzVuyPCIZoSJhghAYsEAhfz_n3qxNPZlpNWkssF_RAYyMlBko-nIfHo785TJJtO1J98bgLLzWzLx-NhGNG6PnlzIPKrae-Mo8YYpVt8Nfq4kaqCU09CySL9YEaXiQSNtip4PbEh5__EW6roQSGdCHyqXXO5MSxgL4BNZrTh9X7Q5tsDQV2GBTJOu9RJe5sxmz7I7lf9Mn6O-yb3Uk0JZsw6eNBI46ylrfd0YtguMLlnEZJ5JKP64WYforKDZ6YKHb2nRGktZNOKTy9FTOMQkRR3E94KB_SIWyoV7xZ_i-R5i2KR-d22JSi8pC1uw8-ybLiwTjtEoamNcQ",
};

/// Key introduced by rotation
pub const ROTATED: FixtureKey = FixtureKey {
    private_pem: include_str!("../fixtures/rotated_rsa.pem"),
    n: "m9nknENJauxsrZThJJlLLarCHtdBKbb2nSkXvBXBKNZU8ZukPril6JwPN7vKp9sUPIfwoOy1bX9Ah3qNNUSeRyqidGgPhgJxaL_0FZYt93HZ6QCTEy4gkZjscqtRTOHgA1hD2QCf2dogHYhLEKcErsPECBnOyHYLCKClYKco_2jJqaiF4FQxws9xgmN-oEjoPeItqyIAKd0G61Zx5Pmqrc2T1RrrTIXpXjsNbVX_wGCEVJffTlop1SANK-nskMa-V67ecs9MP4sdtfeFJEVK9xGHrZNJ-1xeWYJ8Le1zV5APRHtHdca-uS624kfXVXL7Ulb5CFTvBsTeIq1oVMd8rQ",
};

impl FixtureKey {
    /// Public JWK for this key under `kid`
    pub fn jwk(&self, kid: &str) -> serde_json::Value {
        json!({
            "kid": kid,
            "kty": "RSA",
            "alg": "RS256",
            "use": "sig",
            "n": self.n,
            "e": FIXTURE_E,
        })
    }

    /// Mint an RS256 token signed with this key
    pub fn mint(&self, kid: &str, claims: &serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(kid.to_string());
        let key = EncodingKey::from_rsa_pem(self.private_pem.as_bytes()).expect("Invalid RSA key");
        encode(&header, claims, &key).expect("Failed to encode test JWT")
    }
}

/// Mock Keycloak realm
pub struct MockKeycloak {
    pub server: MockServer,
    /// Realm base URL, also used as the issuer
    pub realm_url: String,
    pub certs_path: String,
}

impl MockKeycloak {
    /// Start a mock realm with nothing mounted
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let realm_url = format!("{}/realms/{REALM}", server.uri());

        Self {
            server,
            realm_url,
            certs_path: format!("/realms/{REALM}/protocol/openid-connect/certs"),
        }
    }

    /// Issuer claim of tokens from this realm
    pub fn issuer(&self) -> &str {
        &self.realm_url
    }

    /// Serve `keys` on every request
    pub async fn mock_jwks(&self, keys: Vec<serde_json::Value>) {
        Mock::given(method("GET"))
            .and(path(self.certs_path.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "keys": keys })))
            .mount(&self.server)
            .await;
    }

    /// Serve `keys` for the next `times` requests only; later mounts answer afterwards
    pub async fn mock_jwks_times(&self, keys: Vec<serde_json::Value>, times: u64) {
        Mock::given(method("GET"))
            .and(path(self.certs_path.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "keys": keys })))
            .up_to_n_times(times)
            .mount(&self.server)
            .await;
    }

    /// Serve `keys` and fail the test on drop unless exactly `expected` fetches happened
    pub async fn mock_jwks_expect(&self, keys: Vec<serde_json::Value>, expected: u64) {
        Mock::given(method("GET"))
            .and(path(self.certs_path.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "keys": keys })))
            .expect(expected)
            .mount(&self.server)
            .await;
    }

    /// Answer the certs endpoint with an arbitrary response
    pub async fn mock_jwks_response(&self, response: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path(self.certs_path.as_str()))
            .respond_with(response)
            .mount(&self.server)
            .await;
    }

    /// Number of requests the certs endpoint received
    pub async fn jwks_fetches(&self) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path() == self.certs_path)
            .count()
    }

    /// Configuration trusting this realm
    pub fn config(&self) -> ValidatorConfig {
        ValidatorConfig::new(self.issuer(), &self.realm_url)
            .with_fetch_timeout(Duration::from_secs(2))
    }

    /// Validator for this realm with the given refresh cooldown
    pub fn validator(&self, refresh_cooldown: Duration) -> TokenValidator {
        TokenValidator::new(self.config().with_refresh_cooldown(refresh_cooldown))
            .expect("Failed to build validator")
    }

    /// Validator sharing an explicit cache, fetching through a caller-built HTTP client
    pub fn validator_with_cache(&self, cache: Arc<KeySetCache>) -> TokenValidator {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .expect("Failed to build HTTP client");
        let source = tokengate::jwt::HttpKeySource::with_client(client);
        TokenValidator::with_key_source(self.config(), Arc::new(source), cache)
            .expect("Failed to build validator")
    }

    /// Access token claims for `sub` with realm roles, expiring `exp_offset_secs` from now
    pub fn claims(&self, sub: &str, roles: &[&str], exp_offset_secs: i64) -> serde_json::Value {
        let now = current_timestamp();
        json!({
            "iss": self.issuer(),
            "sub": sub,
            "azp": "gamify-frontend",
            "exp": (now as i64 + exp_offset_secs) as u64,
            "iat": now,
            "realm_access": { "roles": roles },
        })
    }
}

/// Get current Unix timestamp
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_secs()
}
