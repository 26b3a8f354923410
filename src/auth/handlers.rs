use axum::{
    extract::State,
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tracing::instrument;

use crate::{
    auth::{
        cookies::{get_cookie, REFRESH_COOKIE},
        dto::{AuthResponse, ChangePasswordRequest, LoginRequest, RefreshRequest, TokenPair},
        extractors::AuthUser,
        services,
    },
    error::AppError,
    state::AppState,
    users::PublicUser,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/users/login", post(login))
        .route("/users/refresh-token", post(refresh_token))
}

pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/users/logout", post(logout))
        .route("/users/change-password", post(change_password))
        .route("/users/current-user", get(current_user))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<(HeaderMap, Json<AuthResponse>), AppError> {
    let out = services::login(&state, payload).await?;
    Ok((
        out.cookies.into_headers(),
        Json(AuthResponse {
            user: out.user,
            tokens: out.tokens,
        }),
    ))
}

#[instrument(skip_all)]
pub async fn refresh_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<RefreshRequest>>,
) -> Result<(HeaderMap, Json<TokenPair>), AppError> {
    let presented = get_cookie(&headers, REFRESH_COOKIE)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .or_else(|| body.and_then(|Json(b)| b.refresh_token));

    let out = services::refresh(&state, presented).await?;
    Ok((out.cookies.into_headers(), Json(out.tokens)))
}

#[instrument(skip(state, auth), fields(user_id = %auth.id, username = %auth.username))]
pub async fn logout(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<(HeaderMap, Json<Value>), AppError> {
    let cookies = services::logout(&state, &auth).await?;
    Ok((cookies.into_headers(), Json(json!({}))))
}

#[instrument(skip(state, auth, payload), fields(user_id = %auth.id, username = %auth.username))]
pub async fn change_password(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Json<Value>, AppError> {
    services::change_password(&state, &auth, payload).await?;
    Ok(Json(json!({})))
}

#[instrument(skip(state, auth), fields(user_id = %auth.id, username = %auth.username))]
pub async fn current_user(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<PublicUser>, AppError> {
    Ok(Json(services::current_user(&state, &auth).await?))
}
