use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{request::Parts, StatusCode},
};
use tracing::warn;
use uuid::Uuid;

use super::claims::{Claims, TokenKind};
use super::jwt::JwtKeys;

/// Extracts and validates the bearer access token, returning the user ID.
#[derive(Debug)]
pub struct AuthUser(pub Uuid);

/// Like [`AuthUser`], but only for tokens carrying the staff role.
#[derive(Debug)]
pub struct StaffUser(pub Uuid);

fn access_claims(parts: &Parts, keys: &JwtKeys) -> Result<Claims, (StatusCode, String)> {
    let auth = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or((StatusCode::UNAUTHORIZED, "Missing Authorization header".into()))?;

    // Expect "Bearer <token>"
    let token = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .ok_or((StatusCode::UNAUTHORIZED, "Invalid Authorization header".into()))?;

    let claims = keys.verify(token).map_err(|_| {
        warn!("invalid or expired token");
        (StatusCode::UNAUTHORIZED, "Invalid or expired token".to_string())
    })?;

    if claims.kind != TokenKind::Access {
        return Err((StatusCode::UNAUTHORIZED, "Access token required".into()));
    }
    Ok(claims)
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    JwtKeys: FromRef<S>,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let keys = JwtKeys::from_ref(state);
        let claims = access_claims(parts, &keys)?;
        Ok(AuthUser(claims.sub))
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for StaffUser
where
    S: Send + Sync,
    JwtKeys: FromRef<S>,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let keys = JwtKeys::from_ref(state);
        let claims = access_claims(parts, &keys)?;
        if !claims.staff {
            warn!(user_id = %claims.sub, "staff route denied");
            return Err((StatusCode::FORBIDDEN, "Staff access required".into()));
        }
        Ok(StaffUser(claims.sub))
    }
}
