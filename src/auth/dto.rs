use serde::{Deserialize, Serialize};

use super::cookies::CookieJar;
use crate::users::PublicUser;

/// Request body for login. At least one of `username` / `email` is required.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub password: String,
}

/// Request body for token refresh; the cookie takes precedence when both are sent.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Response body for login.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub user: PublicUser,
    #[serde(flatten)]
    pub tokens: TokenPair,
}

/// Result of a successful login.
#[derive(Debug)]
pub struct LoginOutcome {
    pub user: PublicUser,
    pub tokens: TokenPair,
    pub cookies: CookieJar,
}

/// Result of a successful refresh rotation.
#[derive(Debug)]
pub struct RefreshOutcome {
    pub tokens: TokenPair,
    pub cookies: CookieJar,
}
