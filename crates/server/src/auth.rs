use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use realtime::{auth::CredentialVerifier, RealtimeError};
use serde::{Deserialize, Serialize};
use shared::domain::UserId;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    id: i64,
    iat: i64,
    exp: i64,
}

pub fn mint_access_token(
    cfg: &JwtConfig,
    user_id: UserId,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let exp = now + Duration::seconds(cfg.ttl_seconds);
    let claims = Claims {
        id: user_id.0,
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.secret.as_bytes()),
    )
}

/// HS256 access-token check used by the socket gate and the REST routes.
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(cfg: &JwtConfig) -> Self {
        Self {
            key: DecodingKey::from_secret(cfg.secret.as_bytes()),
            validation: Validation::default(),
        }
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<UserId, RealtimeError> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| UserId(data.claims.id))
            .map_err(|err| {
                debug!(error = %err, "access token rejected");
                RealtimeError::unauthenticated("invalid or expired token")
            })
    }
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
