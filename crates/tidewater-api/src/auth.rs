//! Bearer-token guard for the trigger endpoints.
//!
//! The shared secret is never stored in clear: the configuration holds its
//! argon2 PHC string and every request's token is verified against it.

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use axum::{
  extract::FromRequestParts,
  http::{HeaderMap, header, request::Parts},
};

use crate::{AppState, error::ApiError};

#[derive(Clone)]
pub struct AuthConfig {
  /// PHC string produced by argon2, e.g. `$argon2id$v=19$…`
  pub token_hash: String,
}

/// Zero-size marker: present in the handler means the caller presented the
/// trigger secret.
pub struct Authenticated;

pub fn verify_bearer(headers: &HeaderMap, config: &AuthConfig) -> Result<(), ApiError> {
  let token = headers
    .get(header::AUTHORIZATION)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.strip_prefix("Bearer "))
    .map(str::trim)
    .filter(|t| !t.is_empty())
    .ok_or(ApiError::Unauthorized)?;

  let parsed = PasswordHash::new(&config.token_hash).map_err(|e| {
    tracing::error!(error = %e, "trigger token hash is not a valid PHC string");
    ApiError::Unauthorized
  })?;

  Argon2::default()
    .verify_password(token.as_bytes(), &parsed)
    .map_err(|_| ApiError::Unauthorized)
}

impl<S> FromRequestParts<AppState<S>> for Authenticated
where
  S: Send + Sync,
{
  type Rejection = ApiError;

  async fn from_request_parts(parts: &mut Parts, state: &AppState<S>) -> Result<Self, Self::Rejection> {
    verify_bearer(&parts.headers, &state.auth)?;
    Ok(Authenticated)
  }
}
