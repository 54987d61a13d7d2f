use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, StatusCode},
    Json,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use server_api::Caller;
use shared::{
    domain::{Profile, ProfileRole, UserId},
    error::ApiError,
};

use crate::{app_state::AppState, routes::reject};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: UserId,
    role: ProfileRole,
    iat: i64,
    exp: i64,
}

/// HS256 session tokens.
#[derive(Clone)]
pub(crate) struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenKeys {
    pub(crate) fn new(secret: &str, ttl_seconds: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    pub(crate) fn issue(
        &self,
        profile: &Profile,
    ) -> Result<(String, DateTime<Utc>), jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let expires_at = now + self.ttl;
        let claims = Claims {
            sub: profile.id,
            role: profile.role,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .unwrap_or(expires_at);
        Ok((token, expires_at))
    }

    pub(crate) fn verify(&self, token: &str) -> Result<UserId, ApiError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))
            .map_err(|err| {
                tracing::debug!(error = %err, "rejected access token");
                ApiError::unauthorized("invalid or expired access token")
            })?;
        Ok(data.claims.sub)
    }
}

/// Resolves a token to the caller's current profile. Deactivated profiles are refused
/// even while their token is still valid.
pub(crate) async fn authenticate(state: &AppState, token: &str) -> Result<Caller, ApiError> {
    let user_id = state.tokens.verify(token)?;
    let profile = state
        .api
        .storage
        .profile(user_id)
        .await
        .map_err(|err| {
            tracing::error!(error = %format!("{err:#}"), "profile lookup failed");
            ApiError::new(
                shared::error::ErrorCode::Internal,
                server_api::INTERNAL_ERROR_MESSAGE,
            )
        })?
        .filter(|profile| profile.active)
        .ok_or_else(|| ApiError::unauthorized("account is unknown or inactive"))?;
    Ok(Caller {
        user_id: profile.id,
        role: profile.role,
    })
}

/// Extracts the caller from an `Authorization: Bearer` header.
pub(crate) struct AuthUser(pub Caller);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = (StatusCode, Json<ApiError>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| reject(ApiError::unauthorized("missing bearer token")))?;
        authenticate(state, token).await.map(AuthUser).map_err(reject)
    }
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
