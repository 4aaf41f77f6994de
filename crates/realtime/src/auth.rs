//! Authentication gate run once per connection, before any client event is accepted.

use shared::domain::{UserId, UserProfile};
use tracing::debug;

use crate::{
    error::{upstream, RealtimeError},
    RealtimeContext,
};

/// Turns a bearer credential into a user identity.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<UserId, RealtimeError>;
}

/// Accepts `Bearer <token>` as well as the bare token.
pub fn bearer_token(credential: &str) -> Option<&str> {
    let credential = credential.trim();
    let token = credential
        .strip_prefix("Bearer ")
        .or_else(|| credential.strip_prefix("bearer "))
        .unwrap_or(credential)
        .trim();
    (!token.is_empty()).then_some(token)
}

pub async fn authenticate(
    ctx: &RealtimeContext,
    credential: &str,
) -> Result<UserProfile, RealtimeError> {
    let token = bearer_token(credential)
        .ok_or_else(|| RealtimeError::unauthenticated("missing credential"))?;
    let user_id = ctx.verifier.verify(token)?;
    let profile = ctx
        .users
        .find_profile(user_id)
        .await
        .map_err(upstream)?
        .ok_or_else(|| {
            debug!(%user_id, "credential verified for unknown user");
            RealtimeError::unauthenticated("user not found")
        })?;
    Ok(profile)
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
