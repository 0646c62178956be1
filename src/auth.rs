//! Caller identity.
//!
//! With a JWT secret configured, callers present `Authorization: Bearer <jwt>`
//! (HS256) and the `sub` claim is the user id. Without one, the service trusts
//! an `X-User-Id` header, which is only suitable behind a trusted gateway.

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::error::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("Missing credentials")]
    MissingCredentials,

    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

#[derive(Clone, Default)]
pub struct AuthConfig {
    key: Option<Arc<DecodingKey>>,
}

impl AuthConfig {
    pub fn new(jwt_secret: Option<&str>) -> Self {
        Self {
            key: jwt_secret.map(|s| Arc::new(DecodingKey::from_secret(s.as_bytes()))),
        }
    }

    pub fn uses_jwt(&self) -> bool {
        self.key.is_some()
    }

    /// Resolve the user id for a request.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        match &self.key {
            Some(key) => {
                let token = headers
                    .get(AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("Bearer "))
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .ok_or(AuthError::MissingCredentials)?;
                verify(key, token)
            }
            None => headers
                .get(USER_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .ok_or(AuthError::MissingCredentials),
        }
    }
}

fn verify(key: &DecodingKey, token: &str) -> Result<String, AuthError> {
    let data = jsonwebtoken::decode::<Claims>(token, key, &Validation::new(Algorithm::HS256))
        .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

    if data.claims.sub.trim().is_empty() {
        return Err(AuthError::InvalidToken("empty subject".to_string()));
    }
    Ok(data.claims.sub)
}

/// Authenticated user id extracted from the request.
#[derive(Debug, Clone)]
pub struct UserId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for UserId
where
    AuthConfig: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let config = AuthConfig::from_ref(state);
        match config.authenticate(&parts.headers) {
            Ok(user) => Ok(UserId(user)),
            Err(e) => {
                warn!("Rejected {} {}: {}", parts.method, parts.uri.path(), e);
                Err(e.into())
            }
        }
    }
}
