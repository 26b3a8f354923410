use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use tracing::warn;
use uuid::Uuid;

use super::cookies::{get_cookie, ACCESS_COOKIE};
use crate::{error::AppError, state::AppState};

/// Identity proven by a valid access token. Handed explicitly to every protected operation.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,
}

/// Access token from the `accessToken` cookie, else from `Authorization: Bearer`.
fn access_token(parts: &Parts) -> Option<&str> {
    if let Some(t) = get_cookie(&parts.headers, ACCESS_COOKIE).filter(|t| !t.is_empty()) {
        return Some(t);
    }
    let auth = parts.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    auth.strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = access_token(parts).ok_or(AppError::MissingToken)?;

        let claims = state.tokens.verify_access(token).map_err(|e| {
            warn!(error = %e, "access token rejected");
            AppError::from(e)
        })?;

        Ok(AuthUser {
            id: claims.sub,
            username: claims.username,
            email: claims.email,
        })
    }
}
