// Identity boundary - turns a bearer token into a verified identity assertion.
// Token verification belongs to the identity provider; this crate only consumes the result.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Claims about the signed-in person, as vouched for by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityAssertion {
    /// Provider subject id, stored as `users.ext_id`
    pub sub: String,
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub picture: Option<String>,
    /// Expiry as unix seconds
    pub exp: i64,
}

impl IdentityAssertion {
    pub fn is_expired_at(&self, unix_seconds: i64) -> bool {
        self.exp <= unix_seconds
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp())
    }
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Returns `Ok(None)` for tokens that do not carry an identity
    async fn verify(&self, token: &str) -> AppResult<Option<IdentityAssertion>>;
}

/// Accepts assertions forwarded by the authenticating gateway in front of the service.
/// The token is URL-safe base64 of the assertion's JSON; it is trusted as given.
#[derive(Debug, Clone, Default)]
pub struct GatewayAssertionVerifier;

impl GatewayAssertionVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Encode an assertion the way the gateway forwards it
    pub fn encode(assertion: &IdentityAssertion) -> String {
        let json = serde_json::to_vec(assertion).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    fn decode(token: &str) -> AppResult<IdentityAssertion> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim().trim_end_matches('='))
            .map_err(|e| AppError::Unauthorized(format!("Malformed identity assertion: {}", e)))?;
        serde_json::from_slice(&raw)
            .map_err(|e| AppError::Unauthorized(format!("Malformed identity assertion: {}", e)))
    }
}

#[async_trait]
impl IdentityVerifier for GatewayAssertionVerifier {
    async fn verify(&self, token: &str) -> AppResult<Option<IdentityAssertion>> {
        if token.trim().is_empty() {
            return Ok(None);
        }
        let assertion = Self::decode(token)?;
        if assertion.sub.is_empty() {
            return Ok(None);
        }
        Ok(Some(assertion))
    }
}
