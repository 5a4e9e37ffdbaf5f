//! Owner authentication for token issuance
//!
//! Owners present `Authorization: Bearer <jwt>`; the HS256 token's `id`
//! claim names the user.

use axum::http::{header, HeaderMap, StatusCode};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use relaygate_common::{Database, User};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerClaims {
    pub id: Uuid,
    pub exp: i64,
}

/// Verifies owner bearer tokens
#[derive(Clone)]
pub struct OwnerAuth {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl OwnerAuth {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Sign a token for `user_id`
    pub fn issue(&self, user_id: Uuid, ttl: chrono::Duration) -> jsonwebtoken::errors::Result<String> {
        let claims = OwnerClaims {
            id: user_id,
            exp: (chrono::Utc::now() + ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }

    pub fn verify(&self, token: &str) -> jsonwebtoken::errors::Result<OwnerClaims> {
        decode::<OwnerClaims>(token, &self.decoding, &self.validation).map(|td| td.claims)
    }

    /// Resolve the calling owner from request headers
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        db: &Database,
    ) -> Result<User, (StatusCode, &'static str)> {
        let token = bearer_token(headers)
            .ok_or((StatusCode::UNAUTHORIZED, "Missing or invalid authorization header"))?;

        let claims = self.verify(token).map_err(|e| {
            debug!("Rejected owner token: {}", e);
            (StatusCode::UNAUTHORIZED, "Invalid or expired session")
        })?;

        db.get_user(claims.id)
            .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "Session validation failed"))?
            .ok_or((StatusCode::UNAUTHORIZED, "Unknown user"))
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
